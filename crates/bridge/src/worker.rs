use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use guest::{ModuleError, ModuleObserver, OutputStream, SandboxModule, Termination};

use crate::error::TransportError;
use crate::protocol::{
    LifecycleEvent, RemoteError, Reply, Request, RequestEnvelope, RequestKey, RunResult,
    WorkerMessage,
};
use crate::stream::{CapturedOutput, OutputBridge};
use crate::transport::{Inbound, Outbound, WorkerEnd};

enum Signal {
    Ready,
    Terminated(Termination),
}

type SignalQueue = Arc<Mutex<VecDeque<Signal>>>;

struct ProxyObserver {
    bridge: Arc<OutputBridge>,
    signals: SignalQueue,
}

impl ModuleObserver for ProxyObserver {
    fn on_output(&self, stream: OutputStream, chunk: &str) {
        self.bridge.forward(stream, chunk);
    }

    fn on_ready(&self) {
        push_signal(&self.signals, Signal::Ready);
    }

    fn on_terminated(&self, termination: &Termination) {
        push_signal(&self.signals, Signal::Terminated(termination.clone()));
    }
}

fn push_signal(signals: &SignalQueue, signal: Signal) {
    signals
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_back(signal);
}

/// Owns one module and answers requests for it, one at a time.
///
/// Lifecycle notifications raised by the module are held back until the
/// request in flight has its terminal reply, so a quit never overtakes the
/// reply of the call that caused it. Once the module has terminated the
/// worker stops reading requests.
pub struct ModuleWorker<M: SandboxModule> {
    module: M,
    bridge: Arc<OutputBridge>,
    signals: SignalQueue,
    outbound: Arc<dyn Outbound<WorkerMessage>>,
    announced: bool,
    terminated: bool,
}

impl<M: SandboxModule> ModuleWorker<M> {
    pub fn new(mut module: M, outbound: Arc<dyn Outbound<WorkerMessage>>) -> Self {
        let bridge = Arc::new(OutputBridge::new(outbound.clone()));
        let signals = SignalQueue::default();
        module.subscribe(Arc::new(ProxyObserver {
            bridge: bridge.clone(),
            signals: signals.clone(),
        }));
        Self {
            module,
            bridge,
            signals,
            outbound,
            announced: false,
            terminated: false,
        }
    }

    /// Initializes the module, then serves requests until the controller
    /// hangs up or the module terminates.
    pub fn serve(
        mut self,
        inbound: &mut dyn Inbound<RequestEnvelope>,
    ) -> Result<(), TransportError> {
        if let Err(err) = self.module.initialize() {
            tracing::error!(error = %err, "module failed to initialize");
            return self.post(WorkerMessage::Lifecycle(LifecycleEvent::Quit {
                status: 1,
                error: Some(err.to_string()),
            }));
        }
        self.flush_lifecycle()?;
        if !self.announced {
            self.announce_ready()?;
        }

        while !self.terminated {
            match inbound.receive() {
                Ok(Some(envelope)) => self.handle(envelope)?,
                Ok(None) => {
                    tracing::debug!("controller closed the request channel");
                    break;
                }
                Err(TransportError::Malformed {
                    key: Some(key),
                    reason,
                }) => {
                    tracing::warn!(key = %key, reason = %reason, "rejecting malformed request");
                    self.post(WorkerMessage::reply(
                        key,
                        Reply::error(format!("malformed request: {reason}")),
                    ))?;
                }
                Err(err) if err.is_recoverable() => {
                    tracing::warn!(error = %err, "dropping unreadable request");
                }
                Err(err) => return Err(err),
            }
            self.flush_lifecycle()?;
        }
        Ok(())
    }

    pub fn handle(&mut self, envelope: RequestEnvelope) -> Result<(), TransportError> {
        let RequestEnvelope { key, request } = envelope;
        tracing::debug!(key = %key, kind = ?request.kind(), "dispatching request");
        let reply = self.dispatch(&key, request);
        if let Reply::Error(err) = &reply {
            tracing::debug!(key = %key, error = %err.message, "request failed");
        }
        self.post(WorkerMessage::reply(key, reply))
    }

    /// Executes one request and produces its terminal reply. Streamed output
    /// is posted under `key` while the request runs.
    pub fn dispatch(&mut self, key: &RequestKey, request: Request) -> Reply {
        match request {
            Request::Run { args, stdin } => self.run(key, &args, stdin),
            Request::CallFunction { function, args } => self.call_function(key, function, &args),
            Request::SetEnv { name, value } => {
                self.module.environment().insert(name, value);
                Reply::Ok
            }
            Request::PushStdin { chunk } => {
                self.module.push_stdin(&chunk);
                Reply::Ok
            }
            Request::ClearStdin => {
                self.module.clear_stdin();
                Reply::Ok
            }
            Request::WriteTextFile { path, content } => self.write(&path, content.as_bytes()),
            Request::WriteBinaryFile { path, content } => self.write(&path, &content),
            Request::ReadTextFile { path } => match self.read(&path) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(content) => Reply::ReadTextFile { path, content },
                    Err(_) => Reply::error(ModuleError::InvalidUtf8(path).to_string()),
                },
                Err(err) => Reply::error(err.to_string()),
            },
            Request::ReadBinaryFile { path } => match self.read(&path) {
                Ok(content) => Reply::ReadBinaryFile { path, content },
                Err(err) => Reply::error(err.to_string()),
            },
            Request::EnsureDirectory { path } => {
                if let Err(err) = self.guarded(|module| module.mkdir(&path)) {
                    tracing::debug!(path = %path, error = %err, "ensure-directory left as is");
                }
                Reply::Ok
            }
            Request::Batch { requests } => self.batch(key, requests),
        }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    fn run(&mut self, key: &RequestKey, args: &[String], stdin: Option<String>) -> Reply {
        // An empty string means no input, like an absent one.
        let stdin = stdin.filter(|input| !input.is_empty());
        let supplied = stdin.is_some();
        if let Some(input) = stdin {
            self.module.clear_stdin();
            self.module.push_stdin(&input);
        }
        let bridge = self.bridge.clone();
        let (result, output) = bridge.capture(key, || self.guarded(|module| module.run_main(args)));
        if supplied {
            self.module.clear_stdin();
        }
        match result {
            Ok(exit_code) => Reply::Run(RunResult {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code,
                error: None,
            }),
            Err(ModuleError::Exit { status }) => Reply::Run(RunResult {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: status,
                error: (status != 0).then(|| ModuleError::Exit { status }.to_string()),
            }),
            Err(err) => failure(err, output),
        }
    }

    fn call_function(
        &mut self,
        key: &RequestKey,
        function: String,
        args: &[serde_json::Value],
    ) -> Reply {
        if !self.module.has_function(&function) {
            return Reply::error(ModuleError::InvalidFunction(function).to_string());
        }
        let bridge = self.bridge.clone();
        let (result, output) = bridge.capture(key, || {
            self.guarded(|module| module.call_function(&function, args))
        });
        match result {
            Ok(return_value) => Reply::CallFunction {
                function,
                return_value,
            },
            Err(err) => failure(err, output),
        }
    }

    fn read(&mut self, path: &str) -> Result<Vec<u8>, ModuleError> {
        self.guarded(|module| module.read_file(path))
    }

    fn write(&mut self, path: &str, content: &[u8]) -> Reply {
        match self.guarded(|module| module.write_file(path, content)) {
            Ok(()) => Reply::Ok,
            Err(err) => Reply::error(err.to_string()),
        }
    }

    /// Sub-requests run under the batch key. Each one that produces output
    /// opens its own capture, so the batch itself keeps none.
    fn batch(&mut self, key: &RequestKey, requests: Vec<Request>) -> Reply {
        let replies = requests
            .into_iter()
            .map(|request| self.dispatch(key, request))
            .collect();
        Reply::Batch { replies }
    }

    fn guarded<T>(
        &mut self,
        call: impl FnOnce(&mut M) -> Result<T, ModuleError>,
    ) -> Result<T, ModuleError> {
        let module = &mut self.module;
        panic::catch_unwind(AssertUnwindSafe(|| call(module)))
            .unwrap_or_else(|payload| Err(ModuleError::Trap(panic_message(payload))))
    }

    fn flush_lifecycle(&mut self) -> Result<(), TransportError> {
        loop {
            let signal = self
                .signals
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match signal {
                None => return Ok(()),
                Some(Signal::Ready) if self.announced => {}
                Some(Signal::Ready) => self.announce_ready()?,
                Some(Signal::Terminated(termination)) => {
                    self.terminated = true;
                    let event = match termination {
                        Termination::Exit { code } => LifecycleEvent::Exit { code },
                        Termination::Quit { status, error } => {
                            LifecycleEvent::Quit { status, error }
                        }
                    };
                    tracing::info!(?event, "module terminated");
                    self.post(WorkerMessage::Lifecycle(event))?;
                }
            }
        }
    }

    fn announce_ready(&mut self) -> Result<(), TransportError> {
        self.announced = true;
        let environment = self.module.environment().clone();
        self.post(WorkerMessage::Lifecycle(LifecycleEvent::Ready {
            environment,
        }))
    }

    fn post(&self, message: WorkerMessage) -> Result<(), TransportError> {
        self.outbound.post(message)
    }
}

/// Serves `module` over one end of a channel until it closes.
pub fn serve_module<M: SandboxModule>(module: M, end: WorkerEnd) -> Result<(), TransportError> {
    let WorkerEnd {
        outbound,
        mut inbound,
    } = end;
    ModuleWorker::new(module, Arc::from(outbound)).serve(inbound.as_mut())
}

fn failure(err: ModuleError, output: CapturedOutput) -> Reply {
    Reply::Error(RemoteError {
        message: err.to_string(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "module panicked".to_owned())
}
