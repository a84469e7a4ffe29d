use crate::io::{IoError, IpcChannel};
use crate::runtime_error::ExecError;
use crate::value::Value;
use crate::vm::{RuntimeHandler, VirtualMachine};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

/// Primitives scripts use to talk to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFunction {
    Out,
    Out8,
    Out16,
    Out32,
    Out64,
    In8,
    In16,
    In32,
    In64,
    Trace,
    WriteLn,
    ReadLn,
}

impl HostFunction {
    pub const ALL: [HostFunction; 12] = [
        HostFunction::Out,
        HostFunction::Out8,
        HostFunction::Out16,
        HostFunction::Out32,
        HostFunction::Out64,
        HostFunction::In8,
        HostFunction::In16,
        HostFunction::In32,
        HostFunction::In64,
        HostFunction::Trace,
        HostFunction::WriteLn,
        HostFunction::ReadLn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HostFunction::Out => "out",
            HostFunction::Out8 => "out8",
            HostFunction::Out16 => "out16",
            HostFunction::Out32 => "out32",
            HostFunction::Out64 => "out64",
            HostFunction::In8 => "in8",
            HostFunction::In16 => "in16",
            HostFunction::In32 => "in32",
            HostFunction::In64 => "in64",
            HostFunction::Trace => "trace",
            HostFunction::WriteLn => "writeln",
            HostFunction::ReadLn => "readln",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Exact argument count, `None` for variadic functions.
    fn arity(self) -> Option<usize> {
        match self {
            HostFunction::Out
            | HostFunction::Out8
            | HostFunction::Out16
            | HostFunction::Out32
            | HostFunction::Out64
            | HostFunction::WriteLn => Some(1),
            HostFunction::In8
            | HostFunction::In16
            | HostFunction::In32
            | HostFunction::In64
            | HostFunction::ReadLn => Some(0),
            HostFunction::Trace => None,
        }
    }
}

/// Runtime side of the host primitives. Holds the channel to the target
/// for the duration of one execution.
#[derive(Default)]
pub struct HostRuntime {
    channel: Option<Box<dyn IpcChannel>>,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every host primitive of `host` with `vm`.
    pub fn register(host: &Rc<RefCell<HostRuntime>>, vm: &mut VirtualMachine) {
        for function in HostFunction::ALL {
            vm.register_handler(function.name(), host.clone());
        }
    }

    pub fn attach(&mut self, channel: Box<dyn IpcChannel>) {
        self.channel = Some(channel);
    }

    pub fn detach(&mut self) -> Option<Box<dyn IpcChannel>> {
        self.channel.take()
    }

    pub fn is_attached(&self) -> bool {
        self.channel.is_some()
    }

    fn channel(&mut self) -> Result<&mut dyn IpcChannel, IoError> {
        match self.channel.as_deref_mut() {
            Some(channel) => Ok(channel),
            None => Err(IoError::NotConnected),
        }
    }

    fn output(&mut self, function: HostFunction, value: &Value) -> Result<Value, ExecError> {
        let width = match function {
            HostFunction::Out8 => 1,
            HostFunction::Out16 => 2,
            HostFunction::Out32 => 4,
            HostFunction::Out64 => 8,
            _ => {
                let bytes: &[u8] = match value {
                    Value::Opaque(bytes) => bytes,
                    Value::String(text) => text.as_bytes(),
                    other => {
                        return Err(ExecError::type_error(format!(
                            "out() cannot write a value of type {}",
                            other.type_name()
                        )));
                    }
                };
                self.channel()?.send(bytes)?;
                return Ok(Value::Undefined);
            }
        };

        let bits = value.as_bits().ok_or_else(|| {
            ExecError::type_error(format!(
                "{}() expects an integer, got {}",
                function.name(),
                value.type_name()
            ))
        })?;
        self.channel()?.write_uint(bits, width)?;
        Ok(Value::Undefined)
    }

    fn input(&mut self, function: HostFunction) -> Result<Value, ExecError> {
        let channel = self.channel()?;
        let value = match function {
            HostFunction::In8 => channel.read_uint(1)?,
            HostFunction::In16 => channel.read_uint(2)?,
            HostFunction::In32 => channel.read_uint(4)?,
            _ => channel.read_uint(8)?,
        };
        Ok(Value::UInt(value))
    }
}

impl RuntimeHandler for HostRuntime {
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, ExecError> {
        let function = HostFunction::from_name(name)
            .ok_or_else(|| ExecError::runtime(format!("{name} is not a host function")))?;
        if let Some(expected) = function.arity() {
            if args.len() != expected {
                return Err(ExecError::runtime(format!(
                    "{name}() takes {expected} argument(s), {} given",
                    args.len()
                )));
            }
        }

        match function {
            HostFunction::Out
            | HostFunction::Out8
            | HostFunction::Out16
            | HostFunction::Out32
            | HostFunction::Out64 => self.output(function, &args[0]),
            HostFunction::In8 | HostFunction::In16 | HostFunction::In32 | HostFunction::In64 => {
                self.input(function)
            }
            HostFunction::Trace => {
                let message: String = args.iter().map(Value::to_string).collect();
                info!(target: "script", "{message}");
                Ok(Value::Undefined)
            }
            HostFunction::WriteLn => {
                let Value::String(text) = &args[0] else {
                    return Err(ExecError::type_error(format!(
                        "writeln() expects a string, got {}",
                        args[0].type_name()
                    )));
                };
                let channel = self.channel()?;
                channel.send(text.as_bytes())?;
                channel.send(b"\r\n")?;
                Ok(Value::Undefined)
            }
            HostFunction::ReadLn => {
                let line = self.channel()?.read_line()?;
                Ok(Value::string(&line))
            }
        }
    }
}
