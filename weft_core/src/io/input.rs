use super::{IoError, Source};
use crate::ast::{Expression, ExpressionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputField {
    Scalar { width: usize },
    Bytes { len: usize },
    /// Length taken from an earlier scalar field.
    VArray { length_field: usize, max: usize },
}

/// A value captured by `InputLayout::read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputValue {
    Unsigned(u64),
    Bytes(Vec<u8>),
}

/// Schedule of fields to read from a `Source`, each captured for later
/// lookup by the id returned when it was scheduled.
#[derive(Debug, Default)]
pub struct InputLayout {
    fields: Vec<InputField>,
    values: Vec<Option<InputValue>>,
}

impl InputLayout {
    /// Creates an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a layout from the sequence of an input statement
    /// (`[u8, u16<4>, ...] >> $name;`).
    pub fn from_expression(expr: &Expression) -> Result<Self, IoError> {
        let mut layout = Self::new();
        layout.schedule(expr)?;
        Ok(layout)
    }

    fn schedule(&mut self, expr: &Expression) -> Result<(), IoError> {
        match &expr.kind {
            ExpressionKind::Type(ty) | ExpressionKind::Constant { ty, .. } => {
                self.push(InputField::Scalar { width: ty.width() });
            }
            ExpressionKind::Vector { ty, lower, upper } => {
                if lower != upper {
                    return Err(IoError::Layout(format!(
                        "cannot read a ranged vector {ty}<{lower}-{upper}>"
                    )));
                }
                self.push(InputField::Bytes {
                    len: *lower as usize * ty.width(),
                });
            }
            ExpressionKind::Sequence(items) => {
                for item in items {
                    self.schedule(item)?;
                }
            }
            other => {
                return Err(IoError::Layout(format!("cannot read {other:?} from input")));
            }
        }
        Ok(())
    }

    fn push(&mut self, field: InputField) -> usize {
        self.fields.push(field);
        self.values.push(None);
        self.fields.len() - 1
    }

    /// Schedules a one-byte unsigned field and returns its id.
    pub fn u8(&mut self) -> usize {
        self.push(InputField::Scalar { width: 1 })
    }

    pub fn u16(&mut self) -> usize {
        self.push(InputField::Scalar { width: 2 })
    }

    pub fn u24(&mut self) -> usize {
        self.push(InputField::Scalar { width: 3 })
    }

    pub fn u32(&mut self) -> usize {
        self.push(InputField::Scalar { width: 4 })
    }

    pub fn u64(&mut self) -> usize {
        self.push(InputField::Scalar { width: 8 })
    }

    /// Variable length array whose byte count is the value of the
    /// previously scheduled scalar `length_field`, at most `max`.
    pub fn varray(&mut self, length_field: usize, max: usize) -> usize {
        self.push(InputField::VArray { length_field, max })
    }

    /// Number of scheduled fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reads every field in schedule order, replacing values captured by a
    /// previous read.
    ///
    /// # Arguments
    /// * `source` - Where the bytes come from; its byte order decodes the
    ///   scalar fields.
    ///
    /// # Returns
    /// `Ok(())` when all fields were read. A short source is the source's
    /// error; a bad or oversized varray length is `IoError::Layout`.
    pub fn read(&mut self, source: &mut dyn Source) -> Result<(), IoError> {
        for value in self.values.iter_mut() {
            *value = None;
        }
        for index in 0..self.fields.len() {
            let value = match self.fields[index] {
                InputField::Scalar { width } => InputValue::Unsigned(source.read_uint(width)?),
                InputField::Bytes { len } => {
                    let mut data = vec![0u8; len];
                    source.receive(&mut data)?;
                    InputValue::Bytes(data)
                }
                InputField::VArray { length_field, max } => {
                    let count = match self.values.get(length_field) {
                        Some(Some(InputValue::Unsigned(n))) if length_field < index => *n,
                        _ => {
                            return Err(IoError::Layout(format!(
                                "field {index} refers to {length_field}, which is not an earlier scalar"
                            )));
                        }
                    };
                    if count > max as u64 {
                        return Err(IoError::Layout(format!(
                            "array length {count} exceeds maximum {max}"
                        )));
                    }
                    let mut data = vec![0u8; count as usize];
                    source.receive(&mut data)?;
                    InputValue::Bytes(data)
                }
            };
            self.values[index] = Some(value);
        }
        Ok(())
    }

    /// Value of field `id` from the last successful read.
    pub fn get(&self, id: usize) -> Option<&InputValue> {
        self.values.get(id).and_then(Option::as_ref)
    }
}
