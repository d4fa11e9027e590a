use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type Environment = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How the module itself went away, as opposed to one program run ending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    Exit { code: i32 },
    Quit { status: i32, error: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("module is not initialized")]
    NotInitialized,
    #[error("program exited with status {status}")]
    Exit { status: i32 },
    #[error("module terminated: {0:?}")]
    Terminated(Termination),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("file exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("invalid utf-8 content in {0}")]
    InvalidUtf8(String),
    #[error("invalid function {0}")]
    InvalidFunction(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no main entry point")]
    NoMain,
    #[error("{0}")]
    Trap(String),
}

/// Hooks a host subscribes once to follow what the module does on its own.
///
/// `on_output` is called synchronously from inside whatever call produced the
/// chunk, so implementations must not call back into the module.
pub trait ModuleObserver: Send + Sync {
    fn on_output(&self, stream: OutputStream, chunk: &str);
    fn on_ready(&self);
    fn on_terminated(&self, termination: &Termination);
}

/// Capability contract of a sandboxed computation module.
///
/// Every operation is synchronous; the host decides which thread owns the
/// module and serializes calls into it.
pub trait SandboxModule: Send {
    fn subscribe(&mut self, observer: Arc<dyn ModuleObserver>);

    /// Loads the module. Fires `on_ready` once it can be used.
    fn initialize(&mut self) -> Result<(), ModuleError>;

    /// Invokes the main entry point. An exit status raised by the program
    /// surfaces as `ModuleError::Exit`.
    fn run_main(&mut self, args: &[String]) -> Result<i32, ModuleError>;

    fn has_function(&self, name: &str) -> bool;

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, ModuleError>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>, ModuleError>;

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), ModuleError>;

    fn mkdir(&mut self, path: &str) -> Result<(), ModuleError>;

    fn environment(&mut self) -> &mut Environment;

    fn push_stdin(&mut self, chunk: &str);

    fn clear_stdin(&mut self);
}
