use crate::ast::{Expression, ExpressionKind, PrimitiveType};
use crate::io::{Buffer, ByteOrder};
use crate::mutator::{
    ArrayMutator, Evaluator, SharedMutator, UnsignedMutator, UnsignedScalar, share,
};
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("item position {position} is out of range for a template of {len} item(s)")]
    InvalidPosition { position: usize, len: usize },
    #[error("a mutator referenced by the template is being advanced")]
    MutatorBusy,
    #[error("unknown template ${0}")]
    UnknownReference(String),
    #[error("{0}")]
    Unsupported(String),
}

/// Lazily evaluated item. The variant records which capabilities the
/// generator offers; only `Mutator` items are discovered by `mutators()`.
#[derive(Clone)]
pub enum Lazy {
    Evaluator(Rc<dyn Evaluator>),
    Mutator(SharedMutator),
    /// Defers to another template's current serialization, in that
    /// template's own byte order.
    Reference(Rc<Template>),
}

/// One serialized unit of a template. Scalars are written at their natural
/// width in the template's byte order.
#[derive(Clone)]
pub enum Item {
    Byte(u8),
    Word(u16),
    /// Low 24 bits of the value.
    Word24(u32),
    Dword(u32),
    Qword(u64),
    Buffer(Vec<u8>),
    Lazy(Lazy),
}

/// Ordered list of items serialized on demand.
#[derive(Clone, Default)]
pub struct Template {
    items: Vec<Item>,
    order: ByteOrder,
}

/// Result of lowering a template expression: the template and its mutators
/// keyed by the id of the expression they came from.
pub struct LoweredTemplate {
    pub template: Template,
    pub mutators: BTreeMap<usize, SharedMutator>,
}

impl Template {
    /// Creates an empty big-endian template.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `set_order(ByteOrder::LittleEndian)`.
    pub fn little_endian(mut self) -> Self {
        self.order = ByteOrder::LittleEndian;
        self
    }

    /// Builder form of `set_order(ByteOrder::BigEndian)`.
    pub fn big_endian(mut self) -> Self {
        self.order = ByteOrder::BigEndian;
        self
    }

    /// Changes the wire encoding of multi-byte scalars. Stored values are
    /// not touched.
    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// Byte order of multi-byte scalar items.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Number of items, not bytes.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in serialization order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Appends an item or replaces an existing one.
    ///
    /// # Arguments
    /// * `item` - The item to place.
    /// * `position` - `None` to append, `Some(index)` to overwrite the item
    ///   at `index`. A replaced buffer is dropped.
    ///
    /// # Returns
    /// The index the item landed at, or `TemplateError::InvalidPosition`
    /// if `position` is past the end.
    pub fn place(&mut self, item: Item, position: Option<usize>) -> Result<usize, TemplateError> {
        match position {
            None => {
                self.items.push(item);
                Ok(self.items.len() - 1)
            }
            Some(position) if position < self.items.len() => {
                self.items[position] = item;
                Ok(position)
            }
            Some(position) => Err(TemplateError::InvalidPosition {
                position,
                len: self.items.len(),
            }),
        }
    }

    /// Places a fixed byte. The scalar helpers below share `place`'s
    /// `position` semantics.
    pub fn u8(&mut self, value: u8, position: Option<usize>) -> Result<usize, TemplateError> {
        self.place(Item::Byte(value), position)
    }

    pub fn u16(&mut self, value: u16, position: Option<usize>) -> Result<usize, TemplateError> {
        self.place(Item::Word(value), position)
    }

    /// Only the low 24 bits of `value` are emitted.
    pub fn u24(&mut self, value: u32, position: Option<usize>) -> Result<usize, TemplateError> {
        self.place(Item::Word24(value & 0x00FF_FFFF), position)
    }

    pub fn u32(&mut self, value: u32, position: Option<usize>) -> Result<usize, TemplateError> {
        self.place(Item::Dword(value), position)
    }

    pub fn u64(&mut self, value: u64, position: Option<usize>) -> Result<usize, TemplateError> {
        self.place(Item::Qword(value), position)
    }

    /// Places an owned copy of `bytes`, emitted verbatim.
    pub fn array(&mut self, bytes: &[u8], position: Option<usize>) -> Result<usize, TemplateError> {
        self.place(Item::Buffer(bytes.to_vec()), position)
    }

    /// Places an evaluator that is asked for its bytes on every
    /// generation.
    pub fn lazy(
        &mut self,
        evaluator: Rc<dyn Evaluator>,
        position: Option<usize>,
    ) -> Result<usize, TemplateError> {
        self.place(Item::Lazy(Lazy::Evaluator(evaluator)), position)
    }

    /// Places a mutator. It is evaluated like any lazy item and is also
    /// returned by `mutators()`.
    pub fn lazy_mutator(
        &mut self,
        mutator: SharedMutator,
        position: Option<usize>,
    ) -> Result<usize, TemplateError> {
        self.place(Item::Lazy(Lazy::Mutator(mutator)), position)
    }

    /// Places a reference to `target`, which is serialized in full
    /// wherever this item sits.
    pub fn reference(
        &mut self,
        target: Rc<Template>,
        position: Option<usize>,
    ) -> Result<usize, TemplateError> {
        self.place(Item::Lazy(Lazy::Reference(target)), position)
    }

    /// Mutator items in item order. Mutators inside referenced templates
    /// belong to those templates and are not included.
    pub fn mutators(&self) -> Vec<SharedMutator> {
        self.items
            .iter()
            .filter_map(|item| match item {
                Item::Lazy(Lazy::Mutator(m)) => Some(Rc::clone(m)),
                _ => None,
            })
            .collect()
    }

    /// Serializes every item in order without advancing any mutator.
    ///
    /// # Returns
    /// The bytes, or `TemplateError::MutatorBusy` if a mutator of this
    /// template or of a referenced one is currently borrowed mutably.
    pub fn generate(&self) -> Result<Vec<u8>, TemplateError> {
        let mut buffer = Buffer::new(self.order);
        self.generate_into(&mut buffer)?;
        Ok(buffer.into_vec())
    }

    /// Like `generate`, appending to `buffer`. The buffer's own byte order is
    /// restored afterwards.
    pub fn generate_into(&self, buffer: &mut Buffer) -> Result<(), TemplateError> {
        buffer.with_order(self.order, |buffer| {
            for item in &self.items {
                match item {
                    Item::Byte(v) => buffer.put_u8(*v),
                    Item::Word(v) => buffer.put_uint(u64::from(*v), 2),
                    Item::Word24(v) => buffer.put_uint(u64::from(*v), 3),
                    Item::Dword(v) => buffer.put_uint(u64::from(*v), 4),
                    Item::Qword(v) => buffer.put_uint(*v, 8),
                    Item::Buffer(bytes) => buffer.put_slice(bytes),
                    Item::Lazy(Lazy::Evaluator(evaluator)) => evaluator.evaluate(buffer),
                    Item::Lazy(Lazy::Mutator(mutator)) => mutator
                        .try_borrow()
                        .map_err(|_| TemplateError::MutatorBusy)?
                        .evaluate(buffer),
                    Item::Lazy(Lazy::Reference(target)) => target.generate_into(buffer)?,
                }
            }
            Ok(())
        })
    }

    /// Lowers a parsed template expression. Fuzzy scalars become
    /// `UnsignedMutator`s, fuzzy ranged vectors become `ArrayMutator`s and
    /// references compose previously declared templates.
    pub fn from_expression(
        expr: &Expression,
        declared: &BTreeMap<String, Rc<Template>>,
    ) -> Result<LoweredTemplate, TemplateError> {
        let mut lowered = LoweredTemplate {
            template: Template::new(),
            mutators: BTreeMap::new(),
        };
        lower(expr, declared, &mut lowered)?;
        Ok(lowered)
    }
}

fn lower(
    expr: &Expression,
    declared: &BTreeMap<String, Rc<Template>>,
    out: &mut LoweredTemplate,
) -> Result<(), TemplateError> {
    match &expr.kind {
        ExpressionKind::Type(ty) => lower_scalar(expr, *ty, 0, out),
        ExpressionKind::Constant { ty, value } => lower_scalar(expr, *ty, value.bits(), out),
        ExpressionKind::Reference { name } => {
            let target = declared
                .get(name)
                .ok_or_else(|| TemplateError::UnknownReference(name.clone()))?;
            out.template.reference(Rc::clone(target), None)?;
            Ok(())
        }
        ExpressionKind::PropertyAccess { name, property } => Err(TemplateError::Unsupported(
            format!("property ${name}.{property} cannot be serialized"),
        )),
        ExpressionKind::Vector { ty, lower, upper } => {
            let (lower, upper) = (*lower as usize, *upper as usize);
            if expr.fuzzy {
                let mutator = share(ArrayMutator::new(ty.width(), lower, upper));
                out.template.lazy_mutator(Rc::clone(&mutator), None)?;
                out.mutators.insert(expr.id, mutator);
                Ok(())
            } else if lower == upper {
                out.template.array(&vec![0u8; lower * ty.width()], None)?;
                Ok(())
            } else {
                Err(TemplateError::Unsupported(format!(
                    "{ty}<{lower}-{upper}> is only allowed inside a fuzzed sequence"
                )))
            }
        }
        ExpressionKind::Sequence(items) | ExpressionKind::FuzzSequence(items) => {
            for item in items {
                lower(item, declared, out)?;
            }
            Ok(())
        }
    }
}

fn lower_scalar(
    expr: &Expression,
    ty: PrimitiveType,
    bits: u64,
    out: &mut LoweredTemplate,
) -> Result<(), TemplateError> {
    if !expr.fuzzy {
        let template = &mut out.template;
        match ty.width() {
            1 => template.u8(bits as u8, None)?,
            2 => template.u16(bits as u16, None)?,
            3 => template.u24(bits as u32, None)?,
            4 => template.u32(bits as u32, None)?,
            _ => template.u64(bits, None)?,
        };
        return Ok(());
    }
    let mutator = match ty.width() {
        1 => unsigned_mutator::<u8>(bits),
        2 => unsigned_mutator::<u16>(bits),
        4 => unsigned_mutator::<u32>(bits),
        8 => unsigned_mutator::<u64>(bits),
        _ => {
            return Err(TemplateError::Unsupported(format!(
                "{ty} values cannot be fuzzed"
            )));
        }
    };
    out.template.lazy_mutator(Rc::clone(&mutator), None)?;
    out.mutators.insert(expr.id, mutator);
    Ok(())
}

fn unsigned_mutator<T: UnsignedScalar>(bits: u64) -> SharedMutator {
    share(UnsignedMutator::new(T::from_bits(bits)))
}
