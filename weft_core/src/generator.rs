use crate::bytecode::{Instruction, Method, Opcode, Script};
use crate::compile_error::{CompileError, Position};
use crate::lexer::{Lexer, Symbol, Token};
use crate::mutator::{ArrayMutator, AsciiStringMutator, StringForm, UnsignedMutator, share};
use crate::template::Template;
use std::collections::HashMap;
use std::rc::Rc;

/// Compiles a script made of `template` and `function` declarations.
pub fn compile(source: &str) -> Result<Script, CompileError> {
    Generator::new(source).parse_script()
}

/// Single-pass compiler from the script grammar straight to bytecode and
/// materialized templates.
pub struct Generator {
    lexer: Lexer,
    script: Script,
}

/// Per-function compilation state.
struct MethodBuilder {
    method: Method,
    locals: HashMap<String, usize>,
}

impl MethodBuilder {
    fn emit(&mut self, instruction: Instruction) {
        self.method.instructions.push(instruction);
    }

    fn argument(&self, name: &str) -> Option<usize> {
        self.method.arguments.iter().position(|a| a == name)
    }
}

#[derive(Clone, Copy)]
enum Scalar {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Scalar {
    fn from_symbol(symbol: Symbol) -> Option<Self> {
        match symbol {
            Symbol::Byte => Some(Scalar::Byte),
            Symbol::Word => Some(Scalar::Word),
            Symbol::Dword => Some(Scalar::Dword),
            Symbol::Qword => Some(Scalar::Qword),
            _ => None,
        }
    }

    fn width(self) -> usize {
        match self {
            Scalar::Byte => 1,
            Scalar::Word => 2,
            Scalar::Dword => 4,
            Scalar::Qword => 8,
        }
    }

    fn max(self) -> u64 {
        match self {
            Scalar::Qword => u64::MAX,
            other => (1u64 << (other.width() * 8)) - 1,
        }
    }
}

impl Generator {
    pub fn new(source: &str) -> Self {
        Self {
            lexer: Lexer::new(source),
            script: Script::default(),
        }
    }

    pub fn parse_script(mut self) -> Result<Script, CompileError> {
        loop {
            let token = self.lexer.get_sym();
            match token.symbol {
                Symbol::Eof => break,
                Symbol::Template => self.parse_template()?,
                Symbol::Function => self.parse_method()?,
                Symbol::Failure => return Err(self.lexer.failure(&token)),
                other => {
                    return Err(CompileError::parse(
                        token.pos,
                        format!(
                            "expected 'template' or 'function', found {}",
                            other.describe()
                        ),
                    ));
                }
            }
        }
        Ok(self.script)
    }

    fn parse_method(&mut self) -> Result<(), CompileError> {
        let (name, pos) = self.identifier()?;
        if self.script.find_method(&name).is_some() {
            return Err(CompileError::semantic(
                pos,
                format!("function {name} is already defined"),
            ));
        }

        self.expect(Symbol::LParen)?;
        let mut arguments: Vec<String> = Vec::new();
        if self.lexer.peek_symbol() != Symbol::RParen {
            loop {
                let (argument, pos) = self.identifier()?;
                if arguments.contains(&argument) {
                    return Err(CompileError::semantic(
                        pos,
                        format!("duplicate argument {argument}"),
                    ));
                }
                arguments.push(argument);
                if self.lexer.peek_symbol() != Symbol::Comma {
                    break;
                }
                self.lexer.get_sym();
            }
        }
        self.expect(Symbol::RParen)?;

        let mut builder = MethodBuilder {
            method: Method {
                name,
                arguments,
                index: self.script.methods.len(),
                ..Default::default()
            },
            locals: HashMap::new(),
        };

        self.expect(Symbol::LBrace)?;
        while self.lexer.peek_symbol() != Symbol::RBrace {
            self.parse_statement(&mut builder)?;
        }
        self.expect(Symbol::RBrace)?;

        self.script.methods.push(builder.method);
        Ok(())
    }

    fn parse_statement(&mut self, m: &mut MethodBuilder) -> Result<(), CompileError> {
        let token = self.lexer.get_sym();
        match token.symbol {
            Symbol::Var => {
                if self.lexer.peek_symbol() == Symbol::Dollar {
                    self.lexer.get_sym();
                }
                let (name, _) = self.identifier()?;
                self.expect(Symbol::Assign)?;
                self.expression(m)?;
                self.expect(Symbol::Semicolon)?;

                // Every declaration takes a fresh slot; redeclaring a name
                // rebinds it.
                let slot = m.method.num_locals;
                m.method.num_locals += 1;
                m.locals.insert(name, slot);
                m.emit(Instruction::with_index(Opcode::SetLocal, slot_index(token.pos, slot)?));
                Ok(())
            }
            Symbol::Return => {
                self.expression(m)?;
                self.expect(Symbol::Semicolon)?;
                m.emit(Instruction::new(Opcode::Return));
                Ok(())
            }
            Symbol::Dollar | Symbol::Ident => {
                let (name, pos) = if token.symbol == Symbol::Dollar {
                    self.identifier()?
                } else {
                    (self.lexer.text(&token).to_string(), token.pos)
                };

                if self.lexer.peek_symbol() == Symbol::Assign {
                    self.lexer.get_sym();
                    let slot = m.locals.get(&name).copied().ok_or_else(|| {
                        CompileError::semantic(pos, format!("unknown identifier {name}"))
                    })?;
                    self.expression(m)?;
                    self.expect(Symbol::Semicolon)?;
                    m.emit(Instruction::with_index(Opcode::SetLocal, slot_index(pos, slot)?));
                    return Ok(());
                }

                self.identifier_factor(&name, pos, m)?;
                self.term_tail(m)?;
                self.expression_tail(m)?;
                self.expect(Symbol::Semicolon)?;
                m.emit(Instruction::new(Opcode::Pop));
                Ok(())
            }
            Symbol::Failure => Err(self.lexer.failure(&token)),
            other => Err(CompileError::parse(
                token.pos,
                format!("expected a statement, found {}", other.describe()),
            )),
        }
    }

    fn expression(&mut self, m: &mut MethodBuilder) -> Result<(), CompileError> {
        self.term(m)?;
        self.expression_tail(m)
    }

    fn expression_tail(&mut self, m: &mut MethodBuilder) -> Result<(), CompileError> {
        loop {
            let opcode = match self.lexer.peek_symbol() {
                Symbol::Add => Opcode::Add,
                Symbol::Sub => Opcode::Sub,
                _ => return Ok(()),
            };
            self.lexer.get_sym();
            self.term(m)?;
            m.emit(Instruction::new(opcode));
        }
    }

    fn term(&mut self, m: &mut MethodBuilder) -> Result<(), CompileError> {
        self.factor(m)?;
        self.term_tail(m)
    }

    fn term_tail(&mut self, m: &mut MethodBuilder) -> Result<(), CompileError> {
        loop {
            let opcode = match self.lexer.peek_symbol() {
                Symbol::Mul => Opcode::Mul,
                Symbol::Div => Opcode::Div,
                _ => return Ok(()),
            };
            self.lexer.get_sym();
            self.factor(m)?;
            m.emit(Instruction::new(opcode));
        }
    }

    fn factor(&mut self, m: &mut MethodBuilder) -> Result<(), CompileError> {
        let token = self.lexer.get_sym();
        match token.symbol {
            Symbol::Ident => {
                let name = self.lexer.text(&token).to_string();
                self.identifier_factor(&name, token.pos, m)
            }
            Symbol::Dollar => {
                let (name, pos) = self.identifier()?;
                self.identifier_factor(&name, pos, m)
            }
            Symbol::Integer => {
                let value = i64::try_from(token.int().unwrap_or(0)).map_err(|_| {
                    CompileError::semantic(token.pos, "integer literal does not fit in 64 bits")
                })?;
                push_int(m, token.pos, value)
            }
            Symbol::Sub => {
                let literal = self.expect(Symbol::Integer)?;
                let magnitude = i128::from(literal.int().unwrap_or(0));
                let value = i64::try_from(-magnitude).map_err(|_| {
                    CompileError::semantic(literal.pos, "integer literal does not fit in 64 bits")
                })?;
                push_int(m, literal.pos, value)
            }
            Symbol::Add => self.factor(m),
            Symbol::String => {
                let index = pool_index(token.pos, m.method.constant_strings.len())?;
                m.method
                    .constant_strings
                    .push(self.lexer.text(&token).to_string());
                m.emit(Instruction::with_index(Opcode::PushString, index));
                Ok(())
            }
            Symbol::Real => Err(CompileError::semantic(
                token.pos,
                "floating point literals are not supported in scripts",
            )),
            Symbol::Failure => Err(self.lexer.failure(&token)),
            other => Err(CompileError::parse(
                token.pos,
                format!("expected a value, found {}", other.describe()),
            )),
        }
    }

    /// Call, local, argument or template, in that order.
    fn identifier_factor(
        &mut self,
        name: &str,
        pos: Position,
        m: &mut MethodBuilder,
    ) -> Result<(), CompileError> {
        if self.lexer.peek_symbol() == Symbol::LParen {
            return self.call(name, pos, m);
        }

        if let Some(slot) = m.locals.get(name).copied() {
            m.emit(Instruction::with_index(Opcode::GetLocal, slot_index(pos, slot)?));
        } else if let Some(argument) = m.argument(name) {
            m.emit(Instruction::with_index(Opcode::GetArg, slot_index(pos, argument)?));
        } else if self.script.templates.contains_key(name) {
            let index = pool_index(pos, m.method.constant_strings.len())?;
            m.method.constant_strings.push(name.to_string());
            m.emit(Instruction::with_index(Opcode::GetTemplate, index));
        } else {
            return Err(CompileError::semantic(
                pos,
                format!("unknown identifier {name}"),
            ));
        }
        Ok(())
    }

    fn call(&mut self, name: &str, pos: Position, m: &mut MethodBuilder) -> Result<(), CompileError> {
        self.expect(Symbol::LParen)?;
        let mut count = 0usize;
        if self.lexer.peek_symbol() != Symbol::RParen {
            loop {
                self.expression(m)?;
                count += 1;
                if self.lexer.peek_symbol() != Symbol::Comma {
                    break;
                }
                self.lexer.get_sym();
            }
        }
        self.expect(Symbol::RParen)?;

        if name == "sizeof" {
            if count != 1 {
                return Err(CompileError::semantic(
                    pos,
                    format!("sizeof takes 1 argument, {count} given"),
                ));
            }
            m.emit(Instruction::new(Opcode::SizeOf));
            return Ok(());
        }

        // Only functions declared earlier are visible; anything else is
        // dispatched to the host.
        if let Some(callee) = self.script.find_method(name) {
            if callee.arity() != count {
                return Err(CompileError::semantic(
                    pos,
                    format!(
                        "{name} takes {} argument(s), {count} given",
                        callee.arity()
                    ),
                ));
            }
            let index = u16::try_from(callee.index)
                .map_err(|_| CompileError::semantic(pos, "too many functions"))?;
            m.emit(Instruction::with_index(Opcode::Call, index));
            return Ok(());
        }

        let count = u8::try_from(count).map_err(|_| {
            CompileError::semantic(pos, format!("too many arguments to {name}"))
        })?;
        let index = pool_index(pos, m.method.constant_strings.len())?;
        m.method.constant_strings.push(name.to_string());
        m.emit(Instruction::call_ext(index, count));
        Ok(())
    }

    fn parse_template(&mut self) -> Result<(), CompileError> {
        let (name, pos) = self.identifier()?;
        if self.script.templates.contains_key(&name) {
            return Err(CompileError::semantic(
                pos,
                format!("template {name} is already defined"),
            ));
        }
        self.expect(Symbol::Assign)?;
        self.expect(Symbol::LBracket)?;

        let mut template = Template::new();
        self.template_items(&mut template, false)?;
        self.expect(Symbol::RBracket)?;
        self.expect(Symbol::Semicolon)?;

        self.script.templates.insert(name, Rc::new(template));
        Ok(())
    }

    fn template_items(&mut self, template: &mut Template, fuzz: bool) -> Result<(), CompileError> {
        loop {
            self.template_item(template, fuzz)?;
            if self.lexer.peek_symbol() != Symbol::Comma {
                return Ok(());
            }
            self.lexer.get_sym();
        }
    }

    fn template_item(&mut self, template: &mut Template, fuzz: bool) -> Result<(), CompileError> {
        let token = self.lexer.get_sym();
        if let Some(scalar) = Scalar::from_symbol(token.symbol) {
            return self.scalar_item(template, scalar, token.pos, fuzz);
        }
        match token.symbol {
            Symbol::LBrace => {
                if fuzz {
                    return Err(CompileError::semantic(
                        token.pos,
                        "fuzzed groups cannot be nested",
                    ));
                }
                self.template_items(template, true)?;
                self.expect(Symbol::RBrace)?;
                Ok(())
            }
            Symbol::CString => self.string_item(template, StringForm::CString, token.pos, fuzz),
            Symbol::Line => self.string_item(template, StringForm::Line, token.pos, fuzz),
            Symbol::Array => self.array_item(template, token.pos, fuzz),
            Symbol::Dollar | Symbol::Ident => {
                let (name, pos) = if token.symbol == Symbol::Dollar {
                    self.identifier()?
                } else {
                    (self.lexer.text(&token).to_string(), token.pos)
                };
                let target = self.script.templates.get(&name).cloned().ok_or_else(|| {
                    CompileError::semantic(pos, format!("unknown template {name}"))
                })?;
                template
                    .reference(target, None)
                    .map_err(|e| CompileError::semantic(pos, e.to_string()))?;
                Ok(())
            }
            Symbol::PascalString => Err(CompileError::semantic(
                token.pos,
                "pascalstring items are not supported",
            )),
            Symbol::Failure => Err(self.lexer.failure(&token)),
            other => Err(CompileError::parse(
                token.pos,
                format!("expected a template item, found {}", other.describe()),
            )),
        }
    }

    fn scalar_item(
        &mut self,
        template: &mut Template,
        scalar: Scalar,
        pos: Position,
        fuzz: bool,
    ) -> Result<(), CompileError> {
        let mut value = 0u64;
        if self.lexer.peek_symbol() == Symbol::LParen {
            self.lexer.get_sym();
            let literal = self.expect(Symbol::Integer)?;
            value = literal.int().unwrap_or(0);
            if value > scalar.max() {
                return Err(CompileError::semantic(
                    literal.pos,
                    format!("{value} does not fit in {} byte(s)", scalar.width()),
                ));
            }
            self.expect(Symbol::RParen)?;
        }

        // Range checked above, the narrowing casts are exact.
        let placed = match (scalar, fuzz) {
            (Scalar::Byte, false) => template.u8(value as u8, None),
            (Scalar::Word, false) => template.u16(value as u16, None),
            (Scalar::Dword, false) => template.u32(value as u32, None),
            (Scalar::Qword, false) => template.u64(value, None),
            (Scalar::Byte, true) => {
                template.lazy_mutator(share(UnsignedMutator::new(value as u8)), None)
            }
            (Scalar::Word, true) => {
                template.lazy_mutator(share(UnsignedMutator::new(value as u16)), None)
            }
            (Scalar::Dword, true) => {
                template.lazy_mutator(share(UnsignedMutator::new(value as u32)), None)
            }
            (Scalar::Qword, true) => {
                template.lazy_mutator(share(UnsignedMutator::new(value)), None)
            }
        };
        placed
            .map(|_| ())
            .map_err(|e| CompileError::semantic(pos, e.to_string()))
    }

    fn string_item(
        &mut self,
        template: &mut Template,
        form: StringForm,
        pos: Position,
        fuzz: bool,
    ) -> Result<(), CompileError> {
        let mut initial: Option<String> = None;
        if self.lexer.peek_symbol() == Symbol::LParen {
            self.lexer.get_sym();
            let literal = self.expect(Symbol::String)?;
            initial = Some(self.lexer.text(&literal).to_string());
            self.expect(Symbol::RParen)?;
        }

        let placed = if fuzz {
            template.lazy_mutator(
                share(AsciiStringMutator::new(form, initial.as_deref())),
                None,
            )
        } else {
            let mut bytes = initial.unwrap_or_default().into_bytes();
            bytes.push(0);
            if form == StringForm::Line {
                bytes.extend_from_slice(b"\r\n");
            }
            template.array(&bytes, None)
        };
        placed
            .map(|_| ())
            .map_err(|e| CompileError::semantic(pos, e.to_string()))
    }

    fn array_item(
        &mut self,
        template: &mut Template,
        pos: Position,
        fuzz: bool,
    ) -> Result<(), CompileError> {
        self.expect(Symbol::Less)?;
        let element = self.lexer.get_sym();
        let scalar = match Scalar::from_symbol(element.symbol) {
            Some(scalar) => scalar,
            None if element.symbol == Symbol::Failure => {
                return Err(self.lexer.failure(&element));
            }
            None => {
                return Err(CompileError::parse(
                    element.pos,
                    format!(
                        "expected an array element type, found {}",
                        element.symbol.describe()
                    ),
                ));
            }
        };
        self.expect(Symbol::Greater)?;

        self.expect(Symbol::LParen)?;
        let lower_token = self.expect(Symbol::Integer)?;
        let lower = count_value(&lower_token)?;
        let upper = if self.lexer.peek_symbol() == Symbol::Sub {
            self.lexer.get_sym();
            let upper_token = self.expect(Symbol::Integer)?;
            if !fuzz {
                return Err(CompileError::semantic(
                    upper_token.pos,
                    "a ranged array must be inside a fuzzed group",
                ));
            }
            count_value(&upper_token)?
        } else {
            lower
        };
        self.expect(Symbol::RParen)?;

        if lower > upper {
            return Err(CompileError::semantic(
                lower_token.pos,
                format!("array lower bound {lower} exceeds upper bound {upper}"),
            ));
        }

        let placed = if fuzz {
            template.lazy_mutator(share(ArrayMutator::new(scalar.width(), lower, upper)), None)
        } else {
            let bytes = lower.checked_mul(scalar.width()).ok_or_else(|| {
                CompileError::semantic(pos, "array is too large")
            })?;
            template.array(&vec![0u8; bytes], None)
        };
        placed
            .map(|_| ())
            .map_err(|e| CompileError::semantic(pos, e.to_string()))
    }

    fn identifier(&mut self) -> Result<(String, Position), CompileError> {
        let token = self.expect(Symbol::Ident)?;
        Ok((self.lexer.text(&token).to_string(), token.pos))
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
}

fn push_int(m: &mut MethodBuilder, pos: Position, value: i64) -> Result<(), CompileError> {
    let index = pool_index(pos, m.method.constant_ints.len())?;
    m.method.constant_ints.push(value);
    m.emit(Instruction::with_index(Opcode::PushInt, index));
    Ok(())
}

fn pool_index(pos: Position, len: usize) -> Result<u16, CompileError> {
    u16::try_from(len).map_err(|_| CompileError::semantic(pos, "constant pool overflow"))
}

fn slot_index(pos: Position, slot: usize) -> Result<u16, CompileError> {
    u16::try_from(slot).map_err(|_| CompileError::semantic(pos, "too many variables"))
}

fn count_value(token: &Token) -> Result<usize, CompileError> {
    usize::try_from(token.int().unwrap_or(0))
        .map_err(|_| CompileError::semantic(token.pos, "array length is too large"))
}
