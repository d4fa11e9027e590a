use std::env;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use guest::SandboxModule;
use uuid::Uuid;

use crate::client::{ClientOptions, ModuleClient};
use crate::config::{BridgeConfig, TransportMode};
use crate::error::ClientError;
use crate::transport::{ControllerEnd, JsonLineReader, JsonLineWriter, thread_channel};
use crate::worker::serve_module;

const WORKER_BIN: &str = "module_worker";

/// The running side of a worker, owned by its client.
pub trait WorkerHandle: Send {
    /// Waits for the worker to stop. The request channel must already be
    /// closed so the worker sees the end of its input.
    fn terminate(&mut self);
    fn identifier(&self) -> String;
}

pub struct ThreadWorker {
    id: String,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle for ThreadWorker {
    fn terminate(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        if join.join().is_err() {
            tracing::warn!(worker = %self.id, "worker thread panicked");
        }
    }

    fn identifier(&self) -> String {
        format!("thread:{}", self.id)
    }
}

/// Runs the module built by `factory` on a dedicated thread. The module is
/// constructed on that thread and never leaves it.
pub fn spawn_thread_worker<M, F>(factory: F) -> Result<(ControllerEnd, ThreadWorker), ClientError>
where
    M: SandboxModule + 'static,
    F: FnOnce() -> M + Send + 'static,
{
    let (controller, worker_end) = thread_channel();
    let id = Uuid::new_v4().simple().to_string();
    let thread_id = id.clone();
    let join = thread::Builder::new()
        .name(format!("module-worker-{}", &id[..8]))
        .spawn(move || {
            if let Err(err) = serve_module(factory(), worker_end) {
                tracing::warn!(worker = %thread_id, error = %err, "worker stopped with an error");
            }
        })
        .map_err(|err| ClientError::Launch(format!("failed to spawn worker thread: {err}")))?;
    Ok((
        controller,
        ThreadWorker {
            id,
            join: Some(join),
        },
    ))
}

pub struct ProcessWorker {
    child: Child,
    grace: Duration,
}

impl WorkerHandle for ProcessWorker {
    fn terminate(&mut self) {
        let deadline = Instant::now() + self.grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid = self.child.id(), %status, "worker process exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        pid = self.child.id(),
                        error = %err,
                        "failed to poll worker process"
                    );
                    break;
                }
            }
        }
        tracing::warn!(
            pid = self.child.id(),
            "worker process did not exit in time, killing it"
        );
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn identifier(&self) -> String {
        format!("pid:{}", self.child.id())
    }
}

/// Starts `bin` as a worker process speaking JSON lines on its stdio. Its
/// stderr is inherited so worker logs reach the terminal.
pub fn spawn_process_worker(
    bin: &Path,
    grace: Duration,
) -> Result<(ControllerEnd, ProcessWorker), ClientError> {
    let mut child = Command::new(bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| ClientError::Launch(format!("failed to spawn {}: {err}", bin.display())))?;
    let Some(stdin) = child.stdin.take() else {
        let _ = child.kill();
        return Err(ClientError::Launch(
            "module worker missing stdin".to_owned(),
        ));
    };
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        return Err(ClientError::Launch(
            "module worker missing stdout".to_owned(),
        ));
    };
    tracing::debug!(pid = child.id(), bin = %bin.display(), "spawned worker process");
    let controller = ControllerEnd {
        outbound: Box::new(JsonLineWriter::new(stdin)),
        inbound: Box::new(JsonLineReader::new(BufReader::new(stdout))),
    };
    Ok((controller, ProcessWorker { child, grace }))
}

/// Uses the configured worker binary, or the one installed next to the
/// current executable.
pub fn resolve_worker_bin(configured: Option<&Path>) -> Result<PathBuf, ClientError> {
    if let Some(path) = configured {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ClientError::Launch(format!(
                "module worker binary not found at {}",
                path.display()
            )))
        };
    }
    let current = env::current_exe().map_err(|err| {
        ClientError::Launch(format!("failed to resolve current executable: {err}"))
    })?;
    let mut worker = current
        .parent()
        .ok_or_else(|| ClientError::Launch("failed to resolve executable directory".to_owned()))?
        .to_path_buf();
    worker.push(WORKER_BIN);
    if let Some(ext) = current.extension() {
        worker.set_extension(ext);
    }
    if !worker.exists() {
        return Err(ClientError::Launch(format!(
            "module worker binary not found at {}. Build it with `cargo build -p bridge --bin {WORKER_BIN}`",
            worker.display()
        )));
    }
    Ok(worker)
}

/// Starts a worker the way `config` asks and connects a client to it.
/// `factory` builds the module for the thread transport; a worker process
/// builds its own.
pub fn launch<M, F>(config: &BridgeConfig, factory: F) -> Result<ModuleClient, ClientError>
where
    M: SandboxModule + 'static,
    F: FnOnce() -> M + Send + 'static,
{
    let options = ClientOptions {
        functions: config.functions.clone(),
    };
    let (end, handle) = match config.transport {
        TransportMode::Thread => {
            let (end, worker) = spawn_thread_worker(factory)?;
            let handle: Box<dyn WorkerHandle> = Box::new(worker);
            (end, handle)
        }
        TransportMode::Process => {
            let bin = resolve_worker_bin(config.worker_bin.as_deref())?;
            let (end, worker) = spawn_process_worker(&bin, config.shutdown_grace)?;
            let handle: Box<dyn WorkerHandle> = Box::new(worker);
            (end, handle)
        }
    };
    tracing::info!(worker = %handle.identifier(), transport = ?config.transport, "worker launched");
    ModuleClient::connect(end, options, Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_worker_bin_must_exist() {
        let err = resolve_worker_bin(Some(Path::new("/definitely/not/here"))).unwrap_err();
        assert!(
            matches!(err, ClientError::Launch(message) if message.contains("/definitely/not/here"))
        );
    }

    #[test]
    fn configured_worker_bin_is_used_as_is() {
        let current = env::current_exe().unwrap();
        assert_eq!(resolve_worker_bin(Some(&current)).unwrap(), current);
    }
}
