pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod stream;
pub mod transport;
pub mod worker;

pub use batch::BatchBuilder;
pub use client::{ClientOptions, EnvironmentProxy, ModuleClient, RemoteFunction, SimpleFs};
pub use config::{BridgeConfig, ConfigError, TransportMode};
pub use error::{ClientError, TransportError};
pub use events::{ClientEvents, ListenerId, Listeners, QuitStatus};
pub use launcher::{WorkerHandle, launch, spawn_process_worker, spawn_thread_worker};
pub use protocol::{
    LifecycleEvent, RemoteError, Reply, ReplyKind, Request, RequestKey, RequestKind, RunResult,
    WorkerMessage,
};
pub use worker::{ModuleWorker, serve_module};
