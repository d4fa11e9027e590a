use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use guest::{Environment, Termination};
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::batch::BatchBuilder;
use crate::error::ClientError;
use crate::events::{ClientEvents, QuitStatus};
use crate::launcher::WorkerHandle;
use crate::protocol::{
    LifecycleEvent, Reply, ReplyEnvelope, ReplyKind, Request, RequestEnvelope, RunResult,
    WorkerMessage,
};
use crate::registry::{CorrelationRegistry, ReplyResult};
use crate::transport::{ControllerEnd, Inbound, Outbound};

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Function names the module is expected to export.
    pub functions: Vec<String>,
}

enum Readiness {
    Pending,
    Ready,
    Closed(ClientError),
}

#[derive(Default)]
struct RequestState {
    registry: CorrelationRegistry,
    closed: Option<ClientError>,
}

#[derive(Default)]
struct EnvState {
    vars: Environment,
    /// Writes made before the worker announced itself.
    pre_ready: Environment,
    ready: bool,
}

struct Shared {
    requests: Mutex<RequestState>,
    outbound: Mutex<Option<Box<dyn Outbound<RequestEnvelope>>>>,
    events: ClientEvents,
    env: Mutex<EnvState>,
    readiness: watch::Sender<Readiness>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn submit(&self, request: Request) -> Result<oneshot::Receiver<ReplyResult>, ClientError> {
        let kind = request.kind();
        let (key, receiver) = {
            let mut requests = lock(&self.requests);
            if let Some(err) = &requests.closed {
                return Err(err.clone());
            }
            requests.registry.register(kind.terminal_reply())
        };
        let posted = match lock(&self.outbound).as_ref() {
            Some(outbound) => {
                tracing::debug!(key = %key, ?kind, "sending request");
                outbound
                    .post(RequestEnvelope {
                        key: key.clone(),
                        request,
                    })
                    .map_err(ClientError::from)
            }
            None => Err(ClientError::Disconnected),
        };
        if let Err(err) = posted {
            lock(&self.requests).registry.forget(&key);
            return Err(err);
        }
        Ok(receiver)
    }

    fn route(&self, message: WorkerMessage) {
        self.events.message.emit(&message);
        match message {
            WorkerMessage::Reply(ReplyEnvelope { key, reply }) => match &reply {
                Reply::StdoutChunk { chunk } => {
                    self.events.stdout.emit(chunk.as_str());
                }
                Reply::StderrChunk { chunk } => {
                    self.events.stderr.emit(chunk.as_str());
                }
                _ => {
                    if let Reply::Error(err) = &reply {
                        self.events.error.emit(err);
                    }
                    let unmatched = lock(&self.requests).registry.resolve(&key, reply);
                    if let Err(reply) = unmatched {
                        tracing::warn!(
                            key = %key,
                            kind = ?reply.kind(),
                            "reply matched no pending request"
                        );
                    }
                }
            },
            WorkerMessage::Lifecycle(event) => self.lifecycle(event),
        }
    }

    fn lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Ready { environment } => {
                {
                    let mut env = lock(&self.env);
                    let pre_ready = std::mem::take(&mut env.pre_ready);
                    env.vars = environment;
                    env.vars.extend(pre_ready);
                    env.ready = true;
                }
                tracing::debug!("worker ready");
                self.readiness.send_if_modified(|state| {
                    if matches!(state, Readiness::Pending) {
                        *state = Readiness::Ready;
                        return true;
                    }
                    false
                });
                self.events.ready.emit(&());
            }
            LifecycleEvent::Exit { code } => {
                self.close(ClientError::Terminated(Termination::Exit { code }));
                self.events.exit.emit(&code);
            }
            LifecycleEvent::Quit { status, error } => {
                self.close(ClientError::Terminated(Termination::Quit {
                    status,
                    error: error.clone(),
                }));
                self.events.quit.emit(&QuitStatus { status, error });
            }
        }
    }

    /// Refuses new requests and fails the outstanding ones. Only the first
    /// reason is kept.
    fn close(&self, reason: ClientError) {
        let (reason, rejected) = {
            let mut requests = lock(&self.requests);
            let reason = requests.closed.get_or_insert(reason).clone();
            let rejected = requests.registry.reject_all(&reason);
            (reason, rejected)
        };
        if rejected > 0 {
            tracing::debug!(rejected, reason = %reason, "rejected pending requests");
        }
        self.readiness.send_if_modified(|state| {
            if matches!(state, Readiness::Closed(_)) {
                return false;
            }
            *state = Readiness::Closed(reason);
            true
        });
    }
}

fn read_loop(shared: &Shared, inbound: &mut dyn Inbound<WorkerMessage>) {
    loop {
        match inbound.receive() {
            Ok(Some(message)) => shared.route(message),
            Ok(None) => break,
            Err(err) if err.is_recoverable() => {
                tracing::warn!(error = %err, "dropping malformed worker message");
            }
            Err(err) => {
                tracing::error!(error = %err, "worker channel failed");
                break;
            }
        }
    }
    tracing::debug!("worker channel closed");
    shared.close(ClientError::Disconnected);
}

fn unexpected(expected: ReplyKind, reply: &Reply) -> ClientError {
    ClientError::UnexpectedReply {
        expected,
        received: reply.kind(),
    }
}

/// Controller side of one module worker.
///
/// Every method is safe to call concurrently; replies are matched to their
/// callers by key, so completion order does not matter.
pub struct ModuleClient {
    shared: Arc<Shared>,
    functions: Vec<String>,
    worker: Mutex<Option<Box<dyn WorkerHandle>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ModuleClient {
    /// Starts routing messages from `end`. `worker` is stopped on
    /// [`terminate`](Self::terminate) or drop.
    pub fn connect(
        end: ControllerEnd,
        options: ClientOptions,
        worker: Option<Box<dyn WorkerHandle>>,
    ) -> Result<Self, ClientError> {
        let ControllerEnd {
            outbound,
            mut inbound,
        } = end;
        let (readiness, _) = watch::channel(Readiness::Pending);
        let shared = Arc::new(Shared {
            requests: Mutex::new(RequestState::default()),
            outbound: Mutex::new(Some(outbound)),
            events: ClientEvents::default(),
            env: Mutex::new(EnvState::default()),
            readiness,
        });
        let reader_shared = shared.clone();
        let reader = thread::Builder::new()
            .name("module-client-reader".to_owned())
            .spawn(move || read_loop(&reader_shared, inbound.as_mut()))
            .map_err(|err| ClientError::Launch(format!("failed to spawn reader thread: {err}")))?;
        Ok(Self {
            shared,
            functions: options.functions,
            worker: Mutex::new(worker),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn events(&self) -> &ClientEvents {
        &self.shared.events
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.readiness.borrow(), Readiness::Ready)
    }

    /// Resolves once the worker has announced itself, or fails if the worker
    /// went away first.
    pub async fn wait_ready(&self) -> Result<(), ClientError> {
        let mut readiness = self.shared.readiness.subscribe();
        let state = readiness
            .wait_for(|state| !matches!(state, Readiness::Pending))
            .await
            .map_err(|_| ClientError::Disconnected)?;
        match &*state {
            Readiness::Closed(err) => Err(err.clone()),
            Readiness::Ready | Readiness::Pending => Ok(()),
        }
    }

    pub fn function_names(&self) -> &[String] {
        &self.functions
    }

    /// Handle for a declared function, `None` for names the module was not
    /// declared with.
    pub fn function(&self, name: &str) -> Option<RemoteFunction<'_>> {
        self.functions
            .iter()
            .find(|declared| declared.as_str() == name)
            .map(|name| RemoteFunction {
                client: self,
                name: name.as_str(),
            })
    }

    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let reply = self
            .request(Request::CallFunction {
                function: function.to_owned(),
                args,
            })
            .await?;
        match reply {
            Reply::CallFunction { return_value, .. } => Ok(return_value),
            other => Err(unexpected(ReplyKind::CallFunction, &other)),
        }
    }

    /// Runs the main entry point. With `stdin`, the input buffer holds exactly
    /// that content for the run and is cleared afterwards.
    pub async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<RunResult, ClientError> {
        let reply = self
            .request(Request::Run {
                args: args.iter().map(|arg| (*arg).to_owned()).collect(),
                stdin: stdin.map(str::to_owned),
            })
            .await?;
        match reply {
            Reply::Run(result) => Ok(result),
            other => Err(unexpected(ReplyKind::Run, &other)),
        }
    }

    pub async fn main(&self, args: &[&str]) -> Result<i32, ClientError> {
        Ok(self.run(args, None).await?.exit_code)
    }

    pub async fn push_stdin(&self, chunk: &str) -> Result<(), ClientError> {
        self.request(Request::PushStdin {
            chunk: chunk.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn clear_stdin(&self) -> Result<(), ClientError> {
        self.request(Request::ClearStdin).await.map(drop)
    }

    pub fn fs(&self) -> SimpleFs<'_> {
        SimpleFs { client: self }
    }

    pub fn env(&self) -> EnvironmentProxy<'_> {
        EnvironmentProxy { client: self }
    }

    pub fn batch(&self) -> BatchBuilder<'_> {
        BatchBuilder::new(self)
    }

    /// Closes the request channel, waits for an owned worker to stop and
    /// fails whatever was still pending.
    pub fn terminate(&self) {
        drop(lock(&self.shared.outbound).take());
        let worker = lock(&self.worker).take();
        let stopped = worker.is_some();
        if let Some(mut worker) = worker {
            tracing::debug!(worker = %worker.identifier(), "terminating worker");
            worker.terminate();
        }
        self.shared.close(ClientError::Disconnected);
        // The reader only ends once the worker side hangs up.
        let Some(reader) = lock(&self.reader).take() else {
            return;
        };
        if !stopped || reader.thread().id() == thread::current().id() {
            return;
        }
        if reader.join().is_err() {
            tracing::warn!("client reader thread panicked");
        }
    }

    /// Sends `request` and waits for its terminal reply. Error replies come
    /// back as `ClientError::Remote`.
    pub(crate) async fn request(&self, request: Request) -> Result<Reply, ClientError> {
        let expected = request.kind().terminal_reply();
        let receiver = self.shared.submit(request)?;
        let reply = receiver.await.map_err(|_| ClientError::Disconnected)??;
        match reply {
            Reply::Error(err) => Err(ClientError::Remote(err)),
            reply if reply.kind() == expected => Ok(reply),
            other => Err(unexpected(expected, &other)),
        }
    }
}

impl Drop for ModuleClient {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub struct RemoteFunction<'a> {
    client: &'a ModuleClient,
    name: &'a str,
}

impl RemoteFunction<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, ClientError> {
        self.client.call(self.name, args).await
    }
}

/// File operations against the module's filesystem.
pub struct SimpleFs<'a> {
    client: &'a ModuleClient,
}

impl SimpleFs<'_> {
    /// Creates `path` unless it exists. Failures are not reported.
    pub async fn ensure_dir(&self, path: &str) -> Result<(), ClientError> {
        self.client
            .request(Request::EnsureDirectory {
                path: path.to_owned(),
            })
            .await
            .map(drop)
    }

    pub async fn write_text_file(&self, path: &str, content: &str) -> Result<(), ClientError> {
        self.client
            .request(Request::WriteTextFile {
                path: path.to_owned(),
                content: content.to_owned(),
            })
            .await
            .map(drop)
    }

    /// Hands `content` to the worker. On the thread transport the buffer
    /// moves without a copy.
    pub async fn write_binary_file(&self, path: &str, content: Vec<u8>) -> Result<(), ClientError> {
        self.client
            .request(Request::WriteBinaryFile {
                path: path.to_owned(),
                content,
            })
            .await
            .map(drop)
    }

    pub async fn read_text_file(&self, path: &str) -> Result<String, ClientError> {
        let reply = self
            .client
            .request(Request::ReadTextFile {
                path: path.to_owned(),
            })
            .await?;
        match reply {
            Reply::ReadTextFile { content, .. } => Ok(content),
            other => Err(unexpected(ReplyKind::ReadTextFile, &other)),
        }
    }

    pub async fn read_binary_file(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let reply = self
            .client
            .request(Request::ReadBinaryFile {
                path: path.to_owned(),
            })
            .await?;
        match reply {
            Reply::ReadBinaryFile { content, .. } => Ok(content),
            other => Err(unexpected(ReplyKind::ReadBinaryFile, &other)),
        }
    }
}

/// Local view of the module environment.
///
/// Reads never round-trip to the worker. Writes update the view at once and
/// are forwarded without waiting for an acknowledgement.
pub struct EnvironmentProxy<'a> {
    client: &'a ModuleClient,
}

impl EnvironmentProxy<'_> {
    pub fn get(&self, name: &str) -> Option<String> {
        lock(&self.client.shared.env).vars.get(name).cloned()
    }

    pub fn vars(&self) -> Environment {
        lock(&self.client.shared.env).vars.clone()
    }

    pub fn set(&self, name: &str, value: &str) -> Result<(), ClientError> {
        {
            let mut env = lock(&self.client.shared.env);
            env.vars.insert(name.to_owned(), value.to_owned());
            if !env.ready {
                env.pre_ready.insert(name.to_owned(), value.to_owned());
            }
        }
        self.client
            .shared
            .submit(Request::SetEnv {
                name: name.to_owned(),
                value: value.to_owned(),
            })
            .map(drop)
    }
}
