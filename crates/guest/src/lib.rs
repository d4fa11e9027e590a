pub mod fs;
pub mod memory;
pub mod module;
pub mod toolbox;

pub use memory::{MemoryModule, MemoryModuleBuilder, ModuleContext};
pub use module::{
    Environment, ModuleError, ModuleObserver, OutputStream, SandboxModule, Termination,
};
