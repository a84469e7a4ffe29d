pub mod ast;
pub mod bytecode;
pub mod campaign;
pub mod compile_error;
pub mod config;
pub mod executor;
pub mod file_fuzzer;
pub mod generator;
pub mod host;
pub mod io;
pub mod lexer;
pub mod mutator;
pub mod oracle;
pub mod parser;
pub mod runtime_error;
pub mod template;
pub mod value;
pub mod vm;

pub use bytecode::{Instruction, Method, Opcode, Script};
pub use campaign::{CampaignReport, CampaignSettings, FuzzServer, ScriptFailure};
pub use compile_error::{CompileError, Position};
pub use config::WeftConfig;
pub use executor::{
    ApplicationExecuter, ExecutorError, ProcessExecuter, ProcessExecuterConfig, TerminationReason,
};
pub use file_fuzzer::{FileFuzzError, FileFuzzReport, FileFuzzer};
pub use generator::compile;
pub use host::{HostFunction, HostRuntime};
pub use io::{ByteOrder, IoError, IpcChannel, IpcListener, TcpIpcListener};
pub use mutator::{Evaluator, FileMutator, Mutator, MutatorError, SharedMutator};
pub use oracle::{BugReport, CrashOracle, FindingStore, Oracle};
pub use runtime_error::ExecError;
pub use template::{Template, TemplateError};
pub use value::Value;
pub use vm::{RuntimeHandler, VirtualMachine};
