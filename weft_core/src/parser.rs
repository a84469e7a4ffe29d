use crate::ast::{ConstantValue, Expression, ExpressionKind, PrimitiveType, Statement};
use crate::compile_error::CompileError;
use crate::lexer::{Lexer, Symbol, Token};

/// Recursive-descent parser for the template expression language and the
/// statement forms built on top of it.
pub struct Parser {
    lexer: Lexer,
    next_id: usize,
    fuzz_depth: usize,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Self {
            lexer: Lexer::new(source),
            next_id: 0,
            fuzz_depth: 0,
        }
    }

    /// Parses statements until the end of input.
    pub fn parse_statements(&mut self) -> Result<Vec<Statement>, CompileError> {
        let mut statements = Vec::new();
        while self.lexer.peek_symbol() != Symbol::Eof {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    pub fn parse_statement(&mut self) -> Result<Statement, CompileError> {
        let token = self.lexer.peek().clone();
        match token.symbol {
            Symbol::Dollar => {
                let name = self.parse_variable_name()?;
                self.expect(Symbol::Assign)?;
                let value = self.parse_expression()?;
                self.expect(Symbol::Semicolon)?;
                Ok(Statement::Declaration { name, value })
            }
            Symbol::Output => {
                let mut values = Vec::new();
                while self.lexer.peek_symbol() == Symbol::Output {
                    self.lexer.get_sym();
                    values.push(self.parse_expression()?);
                }
                self.expect(Symbol::Semicolon)?;
                Ok(Statement::Output(values))
            }
            Symbol::LBracket => {
                let layout = self.parse_expression()?;
                self.expect(Symbol::Input)?;
                let name = self.parse_variable_name()?;
                self.expect(Symbol::Semicolon)?;
                Ok(Statement::Input { layout, name })
            }
            Symbol::Failure => Err(self.lexer.failure(&token)),
            other => Err(CompileError::parse(
                token.pos,
                format!("expected a statement, found {}", other.describe()),
            )),
        }
    }

    pub fn parse_expression(&mut self) -> Result<Expression, CompileError> {
        let token = self.lexer.get_sym();
        if let Some(ty) = PrimitiveType::from_symbol(token.symbol) {
            return self.parse_primitive(ty);
        }
        match token.symbol {
            Symbol::Dollar => {
                let name = self.parse_identifier()?;
                if self.lexer.peek_symbol() == Symbol::Dot {
                    self.lexer.get_sym();
                    let property = self.parse_identifier()?;
                    Ok(self.make(ExpressionKind::PropertyAccess { name, property }))
                } else {
                    Ok(self.make(ExpressionKind::Reference { name }))
                }
            }
            Symbol::LBracket => {
                let items = self.parse_list(Symbol::RBracket)?;
                Ok(self.make(ExpressionKind::Sequence(items)))
            }
            Symbol::LBrace => {
                if self.fuzz_depth > 0 {
                    return Err(CompileError::semantic(
                        token.pos,
                        "fuzzed sequences cannot be nested",
                    ));
                }
                self.fuzz_depth += 1;
                let items = self.parse_list(Symbol::RBrace);
                self.fuzz_depth -= 1;
                Ok(self.make(ExpressionKind::FuzzSequence(items?)))
            }
            Symbol::Failure => Err(self.lexer.failure(&token)),
            other => Err(CompileError::parse(
                token.pos,
                format!("expected an expression, found {}", other.describe()),
            )),
        }
    }

    fn parse_primitive(&mut self, ty: PrimitiveType) -> Result<Expression, CompileError> {
        match self.lexer.peek_symbol() {
            Symbol::LParen => {
                self.lexer.get_sym();
                let value = self.parse_constant(ty)?;
                self.expect(Symbol::RParen)?;
                Ok(self.make(ExpressionKind::Constant { ty, value }))
            }
            Symbol::Less => {
                self.lexer.get_sym();
                let lower_token = self.expect(Symbol::Integer)?;
                let lower = lower_token.int().unwrap_or(0);
                let upper = if self.lexer.peek_symbol() == Symbol::Sub {
                    self.lexer.get_sym();
                    self.expect(Symbol::Integer)?.int().unwrap_or(0)
                } else {
                    lower
                };
                self.expect(Symbol::Greater)?;
                if lower > upper {
                    return Err(CompileError::semantic(
                        lower_token.pos,
                        format!("vector lower bound {lower} exceeds upper bound {upper}"),
                    ));
                }
                let next = self.lexer.peek().clone();
                if next.symbol == Symbol::LParen {
                    return Err(CompileError::semantic(
                        next.pos,
                        "vectors with values are not supported",
                    ));
                }
                Ok(self.make(ExpressionKind::Vector { ty, lower, upper }))
            }
            _ => Ok(self.make(ExpressionKind::Type(ty))),
        }
    }

    fn parse_constant(&mut self, ty: PrimitiveType) -> Result<ConstantValue, CompileError> {
        let token = self.lexer.get_sym();
        match token.symbol {
            Symbol::Integer => {
                let raw = token.int().unwrap_or(0);
                if ty.is_signed() {
                    let (_, max) = ty.signed_range();
                    if raw > max as u64 {
                        return Err(out_of_range(&token, ty, &raw.to_string()));
                    }
                    Ok(ConstantValue::Signed(raw as i64))
                } else {
                    if raw > ty.unsigned_max() {
                        return Err(out_of_range(&token, ty, &raw.to_string()));
                    }
                    Ok(ConstantValue::Unsigned(raw))
                }
            }
            Symbol::Sub => {
                let digits = self.expect(Symbol::Integer)?;
                let magnitude = digits.int().unwrap_or(0);
                let (min, _) = ty.signed_range();
                let text = format!("-{magnitude}");
                if !ty.is_signed() || magnitude > min.unsigned_abs() {
                    return Err(out_of_range(&token, ty, &text));
                }
                Ok(ConstantValue::Signed(0i64.wrapping_sub_unsigned(magnitude)))
            }
            Symbol::Dollar => Err(CompileError::semantic(
                token.pos,
                "casting references/properties is not implemented",
            )),
            Symbol::Failure => Err(self.lexer.failure(&token)),
            other => Err(CompileError::parse(
                token.pos,
                format!("expected a constant, found {}", other.describe()),
            )),
        }
    }

    fn parse_list(&mut self, close: Symbol) -> Result<Vec<Expression>, CompileError> {
        let mut items = vec![self.parse_expression()?];
        while self.lexer.peek_symbol() == Symbol::Comma {
            self.lexer.get_sym();
            items.push(self.parse_expression()?);
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_variable_name(&mut self) -> Result<String, CompileError> {
        self.expect(Symbol::Dollar)?;
        self.parse_identifier()
    }

    fn parse_identifier(&mut self) -> Result<String, CompileError> {
        let token = self.expect(Symbol::Ident)?;
        Ok(self.lexer.text(&token).to_string())
    }

    fn expect(&mut self, symbol: Symbol) -> Result<Token, CompileError> {
        let token = self.lexer.get_sym();
        if token.symbol == symbol {
            return Ok(token);
        }
        if token.symbol == Symbol::Failure {
            return Err(self.lexer.failure(&token));
        }
        Err(CompileError::parse(
            token.pos,
            format!(
                "expected {}, found {}",
                symbol.describe(),
                token.symbol.describe()
            ),
        ))
    }

    fn make(&mut self, kind: ExpressionKind) -> Expression {
        let id = self.next_id;
        self.next_id += 1;
        Expression {
            id,
            fuzzy: self.fuzz_depth > 0,
            kind,
        }
    }
}

fn out_of_range(token: &Token, ty: PrimitiveType, value: &str) -> CompileError {
    CompileError::semantic(token.pos, format!("constant {value} does not fit in {ty}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<Expression, CompileError> {
        Parser::new(source).parse_expression()
    }

    #[test]
    fn bare_primitive_yields_type_expression() {
        let cases = [
            ("u8", PrimitiveType::U8),
            ("s8", PrimitiveType::S8),
            ("u16", PrimitiveType::U16),
            ("s16", PrimitiveType::S16),
            ("u24", PrimitiveType::U24),
            ("s24", PrimitiveType::S24),
            ("u32", PrimitiveType::U32),
            ("s32", PrimitiveType::S32),
            ("u64", PrimitiveType::U64),
            ("s64", PrimitiveType::S64),
        ];
        for (source, expected) in cases {
            let expr = parse(source).unwrap();
            assert_eq!(
                expr.kind,
                ExpressionKind::Type(expected),
                "Wrong type for {source}"
            );
        }
    }

    #[test]
    fn constant_is_bounds_checked() {
        let expr = parse("u8(10)").unwrap();
        assert_eq!(
            expr.kind,
            ExpressionKind::Constant {
                ty: PrimitiveType::U8,
                value: ConstantValue::Unsigned(10)
            }
        );

        let err = parse("u8(300)").unwrap_err();
        assert!(matches!(err, CompileError::Semantic { .. }), "got {err:?}");
        assert!(parse("u16(65535)").is_ok());
        assert!(parse("u16(65536)").is_err());
    }

    #[test]
    fn signed_constants_accept_negative_values() {
        let expr = parse("s8(-128)").unwrap();
        assert_eq!(
            expr.kind,
            ExpressionKind::Constant {
                ty: PrimitiveType::S8,
                value: ConstantValue::Signed(-128)
            }
        );
        assert!(parse("s8(-129)").is_err());
        assert!(parse("s8(128)").is_err());
        assert!(parse("u8(-1)").is_err(), "Unsigned types reject negatives");
        assert!(parse("s64(-9223372036854775808)").is_ok());
    }

    #[test]
    fn casting_a_reference_fails_loudly() {
        let err = parse("u32($x)").unwrap_err();
        match err {
            CompileError::Semantic { message, .. } => assert!(message.contains("casting")),
            other => panic!("Expected semantic error, got {other:?}"),
        }
    }

    #[test]
    fn vectors_take_fixed_or_ranged_bounds() {
        let fixed = parse("u8<100>").unwrap();
        assert_eq!(
            fixed.kind,
            ExpressionKind::Vector {
                ty: PrimitiveType::U8,
                lower: 100,
                upper: 100
            }
        );
        let ranged = parse("u8<100-200>").unwrap();
        assert_eq!(
            ranged.kind,
            ExpressionKind::Vector {
                ty: PrimitiveType::U8,
                lower: 100,
                upper: 200
            }
        );
    }

    #[test]
    fn vectors_with_values_are_rejected() {
        let err = parse("u8<3>(100,200,300)").unwrap_err();
        assert!(matches!(err, CompileError::Semantic { .. }), "got {err:?}");
        assert!(parse("u8<5-2>").is_err(), "Inverted bounds must fail");
    }

    #[test]
    fn references_and_property_access() {
        assert_eq!(
            parse("$x.length").unwrap().kind,
            ExpressionKind::PropertyAccess {
                name: "x".to_string(),
                property: "length".to_string()
            }
        );
        assert_eq!(
            parse("$x").unwrap().kind,
            ExpressionKind::Reference {
                name: "x".to_string()
            }
        );
    }

    #[test]
    fn sequence_collects_elements() {
        let expr = parse("[u8, u32, u16, u24]").unwrap();
        match expr.kind {
            ExpressionKind::Sequence(items) => {
                assert_eq!(items.len(), 4);
                assert_eq!(items[3].kind, ExpressionKind::Type(PrimitiveType::U24));
            }
            other => panic!("Expected sequence, got {other:?}"),
        }
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let err = parse("[]").unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn fuzz_sequence_marks_children_fuzzy() {
        let expr = parse("[{ u8 }]").unwrap();
        let ExpressionKind::Sequence(outer) = expr.kind else {
            panic!("Expected outer sequence");
        };
        assert_eq!(outer.len(), 1);
        assert!(!outer[0].fuzzy);
        let ExpressionKind::FuzzSequence(inner) = &outer[0].kind else {
            panic!("Expected fuzz sequence, got {:?}", outer[0].kind);
        };
        assert!(inner[0].fuzzy, "Children of {{}} must be fuzzy");
    }

    #[test]
    fn nested_fuzz_sequences_are_rejected() {
        let err = parse("{ u8, [ { u16 } ] }").unwrap_err();
        assert!(matches!(err, CompileError::Semantic { .. }), "got {err:?}");
    }

    #[test]
    fn expression_ids_are_unique() {
        let expr = parse("[u8, u16, { u32 }]").unwrap();
        let mut ids = Vec::new();
        fn collect(e: &Expression, ids: &mut Vec<usize>) {
            ids.push(e.id);
            if let ExpressionKind::Sequence(items) | ExpressionKind::FuzzSequence(items) = &e.kind
            {
                for item in items {
                    collect(item, ids);
                }
            }
        }
        collect(&expr, &mut ids);
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len(), "Duplicate ids in {ids:?}");
    }

    #[test]
    fn output_statement() {
        let stmt = Parser::new("<< u32 << u8 << [u32];")
            .parse_statement()
            .unwrap();
        match stmt {
            Statement::Output(values) => assert_eq!(values.len(), 3),
            other => panic!("Expected output statement, got {other:?}"),
        }
    }

    #[test]
    fn input_statement() {
        let stmt = Parser::new("[u32, u8] >> $variable;")
            .parse_statement()
            .unwrap();
        match stmt {
            Statement::Input { layout, name } => {
                assert_eq!(name, "variable");
                assert!(matches!(layout.kind, ExpressionKind::Sequence(ref items) if items.len() == 2));
            }
            other => panic!("Expected input statement, got {other:?}"),
        }
    }

    #[test]
    fn declaration_statement() {
        let statements = Parser::new("$x = [ u32 ];\n<< $x;").parse_statements().unwrap();
        assert_eq!(statements.len(), 2);
        match &statements[0] {
            Statement::Declaration { name, value } => {
                assert_eq!(name, "x");
                assert!(matches!(value.kind, ExpressionKind::Sequence(_)));
            }
            other => panic!("Expected declaration, got {other:?}"),
        }
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = Parser::new("$x = u8\n;;").parse_statements().unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }), "got {err:?}");
        assert_eq!(err.position().row, 2);
    }
}
