use crate::lexer::Symbol;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    U8,
    S8,
    U16,
    S16,
    U24,
    S24,
    U32,
    S32,
    U64,
    S64,
}

impl PrimitiveType {
    pub fn from_symbol(symbol: Symbol) -> Option<Self> {
        let ty = match symbol {
            Symbol::U8 => PrimitiveType::U8,
            Symbol::S8 => PrimitiveType::S8,
            Symbol::U16 => PrimitiveType::U16,
            Symbol::S16 => PrimitiveType::S16,
            Symbol::U24 => PrimitiveType::U24,
            Symbol::S24 => PrimitiveType::S24,
            Symbol::U32 => PrimitiveType::U32,
            Symbol::S32 => PrimitiveType::S32,
            Symbol::U64 => PrimitiveType::U64,
            Symbol::S64 => PrimitiveType::S64,
            _ => return None,
        };
        Some(ty)
    }

    /// Width on the wire, in bytes.
    pub fn width(self) -> usize {
        match self {
            PrimitiveType::U8 | PrimitiveType::S8 => 1,
            PrimitiveType::U16 | PrimitiveType::S16 => 2,
            PrimitiveType::U24 | PrimitiveType::S24 => 3,
            PrimitiveType::U32 | PrimitiveType::S32 => 4,
            PrimitiveType::U64 | PrimitiveType::S64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveType::S8
                | PrimitiveType::S16
                | PrimitiveType::S24
                | PrimitiveType::S32
                | PrimitiveType::S64
        )
    }

    pub fn unsigned_max(self) -> u64 {
        match self.width() {
            8 => u64::MAX,
            w => (1u64 << (w * 8)) - 1,
        }
    }

    /// Inclusive signed range for the signed variants.
    pub fn signed_range(self) -> (i64, i64) {
        match self.width() {
            8 => (i64::MIN, i64::MAX),
            w => {
                let half = 1i64 << (w * 8 - 1);
                (-half, half - 1)
            }
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveType::U8 => "u8",
            PrimitiveType::S8 => "s8",
            PrimitiveType::U16 => "u16",
            PrimitiveType::S16 => "s16",
            PrimitiveType::U24 => "u24",
            PrimitiveType::S24 => "s24",
            PrimitiveType::U32 => "u32",
            PrimitiveType::S32 => "s32",
            PrimitiveType::U64 => "u64",
            PrimitiveType::S64 => "s64",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantValue {
    Unsigned(u64),
    Signed(i64),
}

impl ConstantValue {
    /// Two's complement bit pattern, truncated later to the type's width.
    pub fn bits(self) -> u64 {
        match self {
            ConstantValue::Unsigned(v) => v,
            ConstantValue::Signed(v) => v as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    /// Unique per parse; correlates mutators with their textual origin.
    pub id: usize,
    /// Set on every expression nested inside a `{ ... }` sequence.
    pub fuzzy: bool,
    pub kind: ExpressionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    Type(PrimitiveType),
    Constant {
        ty: PrimitiveType,
        value: ConstantValue,
    },
    Reference {
        name: String,
    },
    PropertyAccess {
        name: String,
        property: String,
    },
    Vector {
        ty: PrimitiveType,
        lower: u64,
        upper: u64,
    },
    Sequence(Vec<Expression>),
    FuzzSequence(Vec<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `$name = expr;`
    Declaration { name: String, value: Expression },
    /// `<< expr << expr;`
    Output(Vec<Expression>),
    /// `[ ... ] >> $name;`
    Input { layout: Expression, name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_ranges_follow_width() {
        assert_eq!(PrimitiveType::U8.unsigned_max(), 255);
        assert_eq!(PrimitiveType::U24.unsigned_max(), 0xFF_FFFF);
        assert_eq!(PrimitiveType::U64.unsigned_max(), u64::MAX);
        assert_eq!(PrimitiveType::S8.signed_range(), (-128, 127));
        assert_eq!(PrimitiveType::S64.signed_range(), (i64::MIN, i64::MAX));
        assert!(PrimitiveType::S16.is_signed());
        assert!(!PrimitiveType::U16.is_signed());
    }

    #[test]
    fn signed_constants_keep_twos_complement_bits() {
        assert_eq!(ConstantValue::Signed(-1).bits(), u64::MAX);
        assert_eq!(ConstantValue::Unsigned(7).bits(), 7);
    }
}
