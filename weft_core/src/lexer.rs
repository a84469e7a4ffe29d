use crate::compile_error::{CompileError, Position};

/// Terminal symbols of both the template grammar and the script grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Eof,
    /// Malformed input; the lexer keeps the reason in `Lexer::last_error`.
    Failure,

    Semicolon,
    Colon,
    Dot,
    Question,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Add,
    Sub,
    Mul,
    Div,
    Dollar,
    Assign,
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    /// `<<`
    Output,
    /// `>>`
    Input,

    Integer,
    Real,
    String,
    Ident,

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
    Byte,
    Word,
    Dword,
    Qword,
    Array,
    Function,
    Template,
    Return,
    Var,
    CString,
    PascalString,
    Line,
}

impl Symbol {
    pub fn describe(self) -> &'static str {
        match self {
            Symbol::Eof => "end of input",
            Symbol::Failure => "malformed token",
            Symbol::Semicolon => "';'",
            Symbol::Colon => "':'",
            Symbol::Dot => "'.'",
            Symbol::Question => "'?'",
            Symbol::Comma => "','",
            Symbol::LParen => "'('",
            Symbol::RParen => "')'",
            Symbol::LBrace => "'{'",
            Symbol::RBrace => "'}'",
            Symbol::LBracket => "'['",
            Symbol::RBracket => "']'",
            Symbol::Add => "'+'",
            Symbol::Sub => "'-'",
            Symbol::Mul => "'*'",
            Symbol::Div => "'/'",
            Symbol::Dollar => "'$'",
            Symbol::Assign => "'='",
            Symbol::Equal => "'=='",
            Symbol::Less => "'<'",
            Symbol::LessEqual => "'<='",
            Symbol::Greater => "'>'",
            Symbol::GreaterEqual => "'>='",
            Symbol::Output => "'<<'",
            Symbol::Input => "'>>'",
            Symbol::Integer => "integer literal",
            Symbol::Real => "real literal",
            Symbol::String => "string literal",
            Symbol::Ident => "identifier",
            Symbol::U8 => "'u8'",
            Symbol::S8 => "'s8'",
            Symbol::U16 => "'u16'",
            Symbol::S16 => "'s16'",
            Symbol::U24 => "'u24'",
            Symbol::S24 => "'s24'",
            Symbol::U32 => "'u32'",
            Symbol::S32 => "'s32'",
            Symbol::U64 => "'u64'",
            Symbol::S64 => "'s64'",
            Symbol::Byte => "'byte'",
            Symbol::Word => "'word'",
            Symbol::Dword => "'dword'",
            Symbol::Qword => "'qword'",
            Symbol::Array => "'array'",
            Symbol::Function => "'function'",
            Symbol::Template => "'template'",
            Symbol::Return => "'return'",
            Symbol::Var => "'var'",
            Symbol::CString => "'cstring'",
            Symbol::PascalString => "'pascalstring'",
            Symbol::Line => "'line'",
        }
    }
}

fn keyword(ident: &str) -> Option<Symbol> {
    let symbol = match ident {
        "u8" => Symbol::U8,
        "s8" => Symbol::S8,
        "u16" => Symbol::U16,
        "s16" => Symbol::S16,
        "u24" => Symbol::U24,
        "s24" => Symbol::S24,
        "u32" => Symbol::U32,
        "s32" => Symbol::S32,
        "u64" => Symbol::U64,
        "s64" => Symbol::S64,
        "byte" => Symbol::Byte,
        "word" => Symbol::Word,
        "dword" => Symbol::Dword,
        "qword" => Symbol::Qword,
        "array" => Symbol::Array,
        "function" => Symbol::Function,
        "template" => Symbol::Template,
        "return" => Symbol::Return,
        "var" => Symbol::Var,
        "cstring" => Symbol::CString,
        "pascalstring" => Symbol::PascalString,
        "line" => Symbol::Line,
        _ => return None,
    };
    Some(symbol)
}

/// Append-only interning table for identifiers and string literals.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    entries: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of `text`, inserting it if it is not present yet.
    pub fn insert(&mut self, text: &str) -> usize {
        if let Some(index) = self.entries.iter().position(|e| e == text) {
            return index;
        }
        self.entries.push(text.to_string());
        self.entries.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenValue {
    None,
    Int(u64),
    Real(f64),
    /// Index into the lexer's symbol table.
    Name(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub symbol: Symbol,
    pub value: TokenValue,
    pub pos: Position,
}

impl Token {
    fn plain(symbol: Symbol, pos: Position) -> Self {
        Self {
            symbol,
            value: TokenValue::None,
            pos,
        }
    }

    pub fn int(&self) -> Option<u64> {
        match self.value {
            TokenValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn real(&self) -> Option<f64> {
        match self.value {
            TokenValue::Real(v) => Some(v),
            _ => None,
        }
    }

    pub fn name_index(&self) -> Option<usize> {
        match self.value {
            TokenValue::Name(i) => Some(i),
            _ => None,
        }
    }
}

/// Character stream to token stream, with one token of lookahead.
pub struct Lexer {
    source: Vec<char>,
    cursor: usize,
    row: usize,
    col: usize,
    symbols: SymbolTable,
    peeked: Option<Token>,
    last_error: Option<String>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            cursor: 0,
            row: 1,
            col: 1,
            symbols: SymbolTable::new(),
            peeked: None,
            last_error: None,
        }
    }

    /// Consumes and returns the next token.
    pub fn get_sym(&mut self) -> Token {
        match self.peeked.take() {
            Some(token) => token,
            None => self.scan(),
        }
    }

    /// Returns the next token without consuming it.
    pub fn peek(&mut self) -> &Token {
        let token = match self.peeked.take() {
            Some(token) => token,
            None => self.scan(),
        };
        self.peeked.insert(token)
    }

    pub fn peek_symbol(&mut self) -> Symbol {
        self.peek().symbol
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Text of an identifier or string token.
    pub fn text(&self, token: &Token) -> &str {
        token
            .name_index()
            .and_then(|i| self.symbols.get(i))
            .unwrap_or("")
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Converts a `Symbol::Failure` token into the error callers report.
    pub fn failure(&self, token: &Token) -> CompileError {
        CompileError::lex(
            token.pos,
            self.last_error().unwrap_or("malformed token").to_string(),
        )
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.cursor).copied()
    }

    fn lookahead(&self) -> Option<char> {
        self.source.get(self.cursor + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        match ch {
            '\n' => {
                self.row += 1;
                self.col = 1;
            }
            '\t' => self.col += 4,
            _ => self.col += 1,
        }
        self.cursor += 1;
        Some(ch)
    }

    fn position(&self) -> Position {
        Position::new(self.row, self.col)
    }

    fn fail(&mut self, pos: Position, message: impl Into<String>) -> Token {
        self.last_error = Some(message.into());
        Token::plain(Symbol::Failure, pos)
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.current() {
                Some(ch) if ch.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.lookahead() == Some('/') => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan(&mut self) -> Token {
        self.skip_whitespace();
        let pos = self.position();
        let Some(ch) = self.current() else {
            return Token::plain(Symbol::Eof, pos);
        };

        if ch.is_ascii_alphabetic() {
            return self.scan_identifier(pos);
        }
        if ch.is_ascii_digit() {
            return self.scan_number(pos);
        }
        if ch == '"' {
            return self.scan_string(pos);
        }

        self.advance();
        let symbol = match ch {
            ';' => Symbol::Semicolon,
            ':' => Symbol::Colon,
            '.' => Symbol::Dot,
            '?' => Symbol::Question,
            ',' => Symbol::Comma,
            '(' => Symbol::LParen,
            ')' => Symbol::RParen,
            '{' => Symbol::LBrace,
            '}' => Symbol::RBrace,
            '[' => Symbol::LBracket,
            ']' => Symbol::RBracket,
            '+' => Symbol::Add,
            '-' => Symbol::Sub,
            '*' => Symbol::Mul,
            '/' => Symbol::Div,
            '$' => Symbol::Dollar,
            '=' => self.follow('=', Symbol::Equal, Symbol::Assign),
            '<' => match self.current() {
                Some('=') => {
                    self.advance();
                    Symbol::LessEqual
                }
                Some('<') => {
                    self.advance();
                    Symbol::Output
                }
                _ => Symbol::Less,
            },
            '>' => match self.current() {
                Some('=') => {
                    self.advance();
                    Symbol::GreaterEqual
                }
                Some('>') => {
                    self.advance();
                    Symbol::Input
                }
                _ => Symbol::Greater,
            },
            other => return self.fail(pos, format!("unexpected character {other:?}")),
        };
        Token::plain(symbol, pos)
    }

    fn follow(&mut self, next: char, matched: Symbol, otherwise: Symbol) -> Symbol {
        if self.current() == Some(next) {
            self.advance();
            matched
        } else {
            otherwise
        }
    }

    fn scan_identifier(&mut self, pos: Position) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if let Some(symbol) = keyword(&ident) {
            return Token::plain(symbol, pos);
        }
        let index = self.symbols.insert(&ident);
        Token {
            symbol: Symbol::Ident,
            value: TokenValue::Name(index),
            pos,
        }
    }

    fn scan_number(&mut self, pos: Position) -> Token {
        if self.current() == Some('0') && matches!(self.lookahead(), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            return self.scan_hex(pos);
        }

        let mut value: u64 = 0;
        while let Some(digit) = self.current().and_then(|c| c.to_digit(10)) {
            self.advance();
            value = match value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(digit)))
            {
                Some(v) => v,
                None => return self.fail(pos, "integer literal does not fit in 64 bits"),
            };
        }

        if self.current() != Some('.') {
            return Token {
                symbol: Symbol::Integer,
                value: TokenValue::Int(value),
                pos,
            };
        }

        self.advance();
        let mut text = format!("{value}.");
        while let Some(ch) = self.current() {
            if !ch.is_ascii_digit() {
                break;
            }
            text.push(ch);
            self.advance();
        }
        if self.current() == Some('f') {
            self.advance();
        }
        match text.parse::<f64>() {
            Ok(real) => Token {
                symbol: Symbol::Real,
                value: TokenValue::Real(real),
                pos,
            },
            Err(_) => self.fail(pos, format!("invalid real literal {text}")),
        }
    }

    fn scan_hex(&mut self, pos: Position) -> Token {
        let mut value: u64 = 0;
        let mut digits = 0;
        while let Some(digit) = self.current().and_then(|c| c.to_digit(16)) {
            self.advance();
            digits += 1;
            if digits > 16 {
                return self.fail(pos, "hex literal does not fit in 64 bits");
            }
            value = (value << 4) | u64::from(digit);
        }
        if digits == 0 {
            return self.fail(pos, "hex literal without digits");
        }
        Token {
            symbol: Symbol::Integer,
            value: TokenValue::Int(value),
            pos,
        }
    }

    fn scan_string(&mut self, pos: Position) -> Token {
        self.advance();
        let mut text = String::new();
        loop {
            match self.current() {
                None => return self.fail(pos, "unterminated string"),
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\n') | Some('\r') | Some('\0') => {
                    return self.fail(pos, "raw newline, carriage return or NUL in string");
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.current() {
                        Some('\\') => '\\',
                        Some('n') => '\n',
                        Some('r') => '\r',
                        Some('t') => '\t',
                        Some(other) => {
                            return self.fail(pos, format!("unknown escape sequence \\{other}"));
                        }
                        None => return self.fail(pos, "unterminated string"),
                    };
                    self.advance();
                    text.push(escaped);
                }
                Some(ch) => {
                    text.push(ch);
                    self.advance();
                }
            }
        }
        let index = self.symbols.insert(&text);
        Token {
            symbol: Symbol::String,
            value: TokenValue::Name(index),
            pos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols_of(source: &str) -> Vec<Symbol> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.get_sym();
            if token.symbol == Symbol::Eof {
                break;
            }
            out.push(token.symbol);
            if token.symbol == Symbol::Failure {
                break;
            }
        }
        out
    }

    #[test]
    fn symbol_table_deduplicates_entries() {
        let mut table = SymbolTable::new();
        let a = table.insert("alpha");
        let b = table.insert("beta");
        let again = table.insert("alpha");
        assert_eq!(a, again, "Re-inserting should return the existing index");
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b), Some("beta"));
        assert_eq!(table.get(7), None);
    }

    #[test]
    fn single_and_double_character_operators() {
        assert_eq!(
            symbols_of("; : . ? , ( ) { } [ ] + - * / $"),
            vec![
                Symbol::Semicolon,
                Symbol::Colon,
                Symbol::Dot,
                Symbol::Question,
                Symbol::Comma,
                Symbol::LParen,
                Symbol::RParen,
                Symbol::LBrace,
                Symbol::RBrace,
                Symbol::LBracket,
                Symbol::RBracket,
                Symbol::Add,
                Symbol::Sub,
                Symbol::Mul,
                Symbol::Div,
                Symbol::Dollar,
            ]
        );
        assert_eq!(
            symbols_of("= == < <= << > >= >>"),
            vec![
                Symbol::Assign,
                Symbol::Equal,
                Symbol::Less,
                Symbol::LessEqual,
                Symbol::Output,
                Symbol::Greater,
                Symbol::GreaterEqual,
                Symbol::Input,
            ]
        );
    }

    #[test]
    fn keywords_are_case_sensitive() {
        assert_eq!(
            symbols_of("u8 U8 template Template"),
            vec![Symbol::U8, Symbol::Ident, Symbol::Template, Symbol::Ident]
        );
    }

    #[test]
    fn identifiers_are_interned() {
        let mut lexer = Lexer::new("foo bar foo");
        let first = lexer.get_sym();
        let second = lexer.get_sym();
        let third = lexer.get_sym();
        assert_eq!(first.name_index(), third.name_index());
        assert_ne!(first.name_index(), second.name_index());
        assert_eq!(lexer.text(&second), "bar");
        assert_eq!(lexer.symbols().len(), 2);
    }

    #[test]
    fn numbers_switch_to_real_on_dot() {
        let mut lexer = Lexer::new("42 3.25 7.5f 0xDEADBEEF");
        assert_eq!(lexer.get_sym().int(), Some(42));
        let real = lexer.get_sym();
        assert_eq!(real.symbol, Symbol::Real);
        assert_eq!(real.real(), Some(3.25));
        assert_eq!(lexer.get_sym().real(), Some(7.5));
        assert_eq!(lexer.get_sym().int(), Some(0xDEAD_BEEF));
        assert_eq!(lexer.get_sym().symbol, Symbol::Eof);
    }

    #[test]
    fn integer_overflow_is_a_failure() {
        let mut lexer = Lexer::new("99999999999999999999999");
        assert_eq!(lexer.get_sym().symbol, Symbol::Failure);
        assert!(lexer.last_error().is_some());
    }

    #[test]
    fn string_escapes_are_decoded() {
        let mut lexer = Lexer::new(r#""a\\b\n\r\t""#);
        let token = lexer.get_sym();
        assert_eq!(token.symbol, Symbol::String);
        assert_eq!(lexer.text(&token), "a\\b\n\r\t");
    }

    #[test]
    fn malformed_strings_fail() {
        for source in ["\"never closed", "\"line\nbreak\"", "\"bad \\q escape\""] {
            let mut lexer = Lexer::new(source);
            let token = lexer.get_sym();
            assert_eq!(
                token.symbol,
                Symbol::Failure,
                "Expected failure symbol for {source:?}"
            );
            let err = lexer.failure(&token);
            assert!(matches!(err, CompileError::Lex { .. }), "got {err:?}");
        }
    }

    #[test]
    fn peek_is_cached_until_consumed() {
        let mut lexer = Lexer::new("a b");
        let peeked = lexer.peek().clone();
        assert_eq!(lexer.peek(), &peeked);
        assert_eq!(lexer.get_sym(), peeked);
        assert_eq!(lexer.get_sym().symbol, Symbol::Ident);
        assert_eq!(lexer.peek_symbol(), Symbol::Eof);
    }

    #[test]
    fn positions_track_rows_and_tabs() {
        let mut lexer = Lexer::new("a\n\tb");
        assert_eq!(lexer.get_sym().pos, Position::new(1, 1));
        assert_eq!(lexer.get_sym().pos, Position::new(2, 5));
    }

    #[test]
    fn line_comments_are_skipped() {
        assert_eq!(
            symbols_of("u8 // trailing words ; ;\n u16"),
            vec![Symbol::U8, Symbol::U16]
        );
    }

    #[test]
    fn unexpected_character_fails() {
        assert_eq!(symbols_of("u8 @"), vec![Symbol::U8, Symbol::Failure]);
    }
}
