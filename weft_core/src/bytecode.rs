use crate::template::Template;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Div,
    Call,
    CallVoid,
    CallExt,
    SizeOf,
    PushInt,
    PushString,
    SetLocal,
    GetLocal,
    GetArg,
    GetTemplate,
    Lookup,
    Pop,
    Return,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Call => "CALL",
            Opcode::CallVoid => "CALLVOID",
            Opcode::CallExt => "CALLEXT",
            Opcode::SizeOf => "SIZEOF",
            Opcode::PushInt => "PUSHINT",
            Opcode::PushString => "PUSHSTRING",
            Opcode::SetLocal => "SETLOCAL",
            Opcode::GetLocal => "GETLOCAL",
            Opcode::GetArg => "GETARG",
            Opcode::GetTemplate => "GETTEMPLATE",
            Opcode::Lookup => "LOOKUP",
            Opcode::Pop => "POP",
            Opcode::Return => "RETURN",
        }
    }

    fn has_index(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallVoid
                | Opcode::CallExt
                | Opcode::PushInt
                | Opcode::PushString
                | Opcode::SetLocal
                | Opcode::GetLocal
                | Opcode::GetArg
                | Opcode::GetTemplate
                | Opcode::Lookup
        )
    }
}

/// One VM instruction. `index` is a slot, pool index or method index
/// depending on the opcode; `count` is only meaningful for `CALLEXT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: Opcode,
    pub index: u16,
    pub count: u8,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            index: 0,
            count: 0,
        }
    }

    pub fn with_index(opcode: Opcode, index: u16) -> Self {
        Self {
            opcode,
            index,
            count: 0,
        }
    }

    pub fn call_ext(name_index: u16, count: u8) -> Self {
        Self {
            opcode: Opcode::CallExt,
            index: name_index,
            count,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::CallExt => write!(f, "CALLEXT {}, {}", self.index, self.count),
            op if op.has_index() => write!(f, "{} {}", op.mnemonic(), self.index),
            op => f.write_str(op.mnemonic()),
        }
    }
}

/// A compiled function body plus its constant pools.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Method {
    pub name: String,
    pub arguments: Vec<String>,
    pub instructions: Vec<Instruction>,
    pub num_locals: usize,
    pub constant_ints: Vec<i64>,
    pub constant_strings: Vec<String>,
    /// Position in `Script::methods`; the operand of `CALL`.
    pub index: usize,
}

impl Method {
    pub fn arity(&self) -> usize {
        self.arguments.len()
    }

    fn disassemble_into(&self, out: &mut String) {
        out.push_str(&format!(
            "function {}({}) ; method #{}, {} local(s)\n",
            self.name,
            self.arguments.join(", "),
            self.index,
            self.num_locals
        ));
        for (ip, instruction) in self.instructions.iter().enumerate() {
            let annotation = match instruction.opcode {
                Opcode::PushInt => self
                    .constant_ints
                    .get(usize::from(instruction.index))
                    .map(|v| format!(" ; {v}")),
                Opcode::PushString | Opcode::CallExt | Opcode::GetTemplate => self
                    .constant_strings
                    .get(usize::from(instruction.index))
                    .map(|s| format!(" ; {s:?}")),
                Opcode::GetArg => self
                    .arguments
                    .get(usize::from(instruction.index))
                    .map(|a| format!(" ; {a}")),
                _ => None,
            };
            out.push_str(&format!(
                "  {ip:04}  {instruction}{}\n",
                annotation.unwrap_or_default()
            ));
        }
    }
}

/// Output of the bytecode generator: methods in declaration order and the
/// named templates.
#[derive(Default)]
pub struct Script {
    pub methods: Vec<Method>,
    pub templates: BTreeMap<String, Rc<Template>>,
}

impl Script {
    pub fn find_method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_at(&self, index: usize) -> Option<&Method> {
        self.methods.get(index)
    }

    pub fn template(&self, name: &str) -> Option<&Rc<Template>> {
        self.templates.get(name)
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for method in &self.methods {
            method.disassemble_into(&mut out);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_equality_is_structural() {
        assert_eq!(
            Instruction::with_index(Opcode::PushInt, 1),
            Instruction::with_index(Opcode::PushInt, 1)
        );
        assert_ne!(
            Instruction::with_index(Opcode::PushInt, 1),
            Instruction::with_index(Opcode::PushInt, 2)
        );
        assert_ne!(Instruction::call_ext(0, 1), Instruction::call_ext(0, 2));
    }

    #[test]
    fn instruction_display() {
        assert_eq!(Instruction::new(Opcode::Add).to_string(), "ADD");
        assert_eq!(
            Instruction::with_index(Opcode::SetLocal, 3).to_string(),
            "SETLOCAL 3"
        );
        assert_eq!(Instruction::call_ext(1, 2).to_string(), "CALLEXT 1, 2");
    }

    #[test]
    fn disassembly_annotates_pool_entries() {
        let method = Method {
            name: "main".to_string(),
            instructions: vec![
                Instruction::with_index(Opcode::PushInt, 0),
                Instruction::call_ext(0, 1),
                Instruction::new(Opcode::Pop),
            ],
            constant_ints: vec![42],
            constant_strings: vec!["out8".to_string()],
            ..Default::default()
        };
        let script = Script {
            methods: vec![method],
            ..Default::default()
        };
        let text = script.disassemble();
        assert!(text.contains("PUSHINT 0 ; 42"), "{text}");
        assert!(text.contains("CALLEXT 0, 1 ; \"out8\""), "{text}");
        assert_eq!(script.find_method("main").map(|m| m.index), Some(0));
        assert!(script.find_method("missing").is_none());
    }
}
