use crate::bytecode::{Instruction, Method, Opcode, Script};
use crate::runtime_error::ExecError;
use crate::value::{BinaryOp, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Receives `CALLEXT` dispatches. Handlers validate their own arity.
pub trait RuntimeHandler {
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, ExecError>;
}

pub type SharedHandler = Rc<RefCell<dyn RuntimeHandler>>;

/// Stack interpreter for compiled scripts. Every invocation gets fresh
/// locals and a fresh operand stack; only the handler table is shared.
#[derive(Default)]
pub struct VirtualMachine {
    handlers: HashMap<String, SharedHandler>,
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes host calls named `name` to `handler`, replacing any earlier
    /// registration.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: SharedHandler) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Runs the script's `main` function.
    pub fn execute_script(&self, script: &Script) -> Result<Value, ExecError> {
        let main = script.find_method("main").ok_or_else(|| {
            ExecError::runtime("script cannot be executed, it has no 'main' function")
        })?;
        self.execute(script, main, Vec::new())
    }

    pub fn execute(
        &self,
        script: &Script,
        method: &Method,
        arguments: Vec<Value>,
    ) -> Result<Value, ExecError> {
        let mut locals = vec![Value::Undefined; method.num_locals];
        let mut stack: Vec<Value> = Vec::new();

        for instruction in &method.instructions {
            trace!(method = %method.name, %instruction, depth = stack.len());
            let index = usize::from(instruction.index);
            match instruction.opcode {
                Opcode::Add => binary(&mut stack, BinaryOp::Add)?,
                Opcode::Sub => binary(&mut stack, BinaryOp::Sub)?,
                Opcode::Mul => binary(&mut stack, BinaryOp::Mul)?,
                Opcode::Div => binary(&mut stack, BinaryOp::Div)?,
                Opcode::SizeOf => {
                    let value = pop(&mut stack)?;
                    stack.push(value.size_of()?);
                }
                Opcode::SetLocal => {
                    let value = pop(&mut stack)?;
                    let slot = locals
                        .get_mut(index)
                        .ok_or_else(|| bad_index("local", instruction))?;
                    *slot = value;
                }
                Opcode::GetLocal => {
                    let value = locals
                        .get(index)
                        .ok_or_else(|| bad_index("local", instruction))?;
                    stack.push(value.clone());
                }
                Opcode::GetArg => {
                    let value = arguments
                        .get(index)
                        .ok_or_else(|| bad_index("argument", instruction))?;
                    stack.push(value.clone());
                }
                Opcode::Pop => {
                    pop(&mut stack)?;
                }
                Opcode::PushInt => {
                    let value = method
                        .constant_ints
                        .get(index)
                        .ok_or_else(|| bad_index("integer constant", instruction))?;
                    stack.push(Value::Int(*value));
                }
                Opcode::PushString => {
                    let value = method
                        .constant_strings
                        .get(index)
                        .ok_or_else(|| bad_index("string constant", instruction))?;
                    stack.push(Value::string(value));
                }
                Opcode::Call | Opcode::CallVoid => {
                    let callee = script
                        .method_at(index)
                        .ok_or_else(|| bad_index("method", instruction))?;
                    let args = pop_arguments(&mut stack, callee.arity())?;
                    let result = self.execute(script, callee, args)?;
                    if instruction.opcode == Opcode::Call {
                        stack.push(result);
                    }
                }
                Opcode::CallExt => {
                    let name = method
                        .constant_strings
                        .get(index)
                        .ok_or_else(|| bad_index("string constant", instruction))?;
                    let handler = self.handlers.get(name).ok_or_else(|| {
                        ExecError::runtime(format!("unknown runtime function {name}"))
                    })?;
                    let args = pop_arguments(&mut stack, usize::from(instruction.count))?;
                    let result = handler
                        .try_borrow_mut()
                        .map_err(|_| {
                            ExecError::runtime(format!("runtime function {name} is already running"))
                        })?
                        .call(name, &args)?;
                    stack.push(result);
                }
                Opcode::GetTemplate => {
                    let name = method
                        .constant_strings
                        .get(index)
                        .ok_or_else(|| bad_index("string constant", instruction))?;
                    let template = script
                        .template(name)
                        .ok_or_else(|| ExecError::runtime(format!("unknown template {name}")))?;
                    let bytes = template
                        .generate()
                        .map_err(|e| ExecError::runtime(format!("template {name}: {e}")))?;
                    stack.push(Value::opaque(bytes));
                }
                Opcode::Lookup => {
                    return Err(ExecError::runtime("LOOKUP is not supported"));
                }
                Opcode::Return => return pop(&mut stack),
            }
        }
        Ok(Value::Undefined)
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, ExecError> {
    stack
        .pop()
        .ok_or_else(|| ExecError::runtime("cannot pop value from empty stack"))
}

/// Pops `count` values, restoring call order.
fn pop_arguments(stack: &mut Vec<Value>, count: usize) -> Result<Vec<Value>, ExecError> {
    if stack.len() < count {
        return Err(ExecError::runtime(format!(
            "stack underflow: call needs {count} argument(s), {} available",
            stack.len()
        )));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn binary(stack: &mut Vec<Value>, op: BinaryOp) -> Result<(), ExecError> {
    let rhs = pop(stack)?;
    let lhs = pop(stack)?;
    stack.push(Value::binary(op, &lhs, &rhs)?);
    Ok(())
}

fn bad_index(what: &str, instruction: &Instruction) -> ExecError {
    ExecError::runtime(format!("invalid {what} index in {instruction}"))
}
