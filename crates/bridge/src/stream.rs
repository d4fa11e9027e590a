use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use guest::OutputStream;

use crate::protocol::{Reply, RequestKey, WorkerMessage};
use crate::transport::Outbound;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

struct Capture {
    key: RequestKey,
    output: CapturedOutput,
}

/// Forwards module output to the controller while a request executes.
///
/// Each chunk is posted immediately as a streamed reply tagged with the key
/// of the innermost open capture, and appended to every open capture.
pub struct OutputBridge {
    captures: Mutex<Vec<Capture>>,
    outbound: Arc<dyn Outbound<WorkerMessage>>,
}

impl OutputBridge {
    pub fn new(outbound: Arc<dyn Outbound<WorkerMessage>>) -> Self {
        Self {
            captures: Mutex::new(Vec::new()),
            outbound,
        }
    }

    /// Runs `call` with output captured for `key`. The capture is closed on
    /// every exit path, including unwinding.
    pub fn capture<T>(&self, key: &RequestKey, call: impl FnOnce() -> T) -> (T, CapturedOutput) {
        let guard = self.open(key);
        let value = call();
        (value, guard.finish())
    }

    pub fn forward(&self, stream: OutputStream, chunk: &str) {
        let key = {
            let mut captures = self.lock();
            let Some(innermost) = captures.last() else {
                tracing::trace!(
                    ?stream,
                    bytes = chunk.len(),
                    "output outside of a request dropped"
                );
                return;
            };
            let key = innermost.key.clone();
            for capture in captures.iter_mut() {
                let buffer = match stream {
                    OutputStream::Stdout => &mut capture.output.stdout,
                    OutputStream::Stderr => &mut capture.output.stderr,
                };
                buffer.push_str(chunk);
            }
            key
        };
        let message = WorkerMessage::reply(key.clone(), Reply::chunk(stream, chunk));
        if let Err(err) = self.outbound.post(message) {
            tracing::warn!(key = %key, error = %err, "failed to stream output chunk");
        }
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    fn open(&self, key: &RequestKey) -> CaptureGuard<'_> {
        let mut captures = self.lock();
        captures.push(Capture {
            key: key.clone(),
            output: CapturedOutput::default(),
        });
        CaptureGuard {
            bridge: self,
            depth: captures.len(),
            closed: false,
        }
    }

    fn close(&self, depth: usize) -> CapturedOutput {
        let mut captures = self.lock();
        captures.truncate(depth);
        captures
            .pop()
            .map(|capture| capture.output)
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Capture>> {
        self.captures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct CaptureGuard<'a> {
    bridge: &'a OutputBridge,
    depth: usize,
    closed: bool,
}

impl CaptureGuard<'_> {
    fn finish(mut self) -> CapturedOutput {
        self.closed = true;
        self.bridge.close(self.depth)
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.bridge.close(self.depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc;

    use super::*;

    fn bridge() -> (OutputBridge, mpsc::Receiver<WorkerMessage>) {
        let (sender, receiver) = mpsc::channel();
        (OutputBridge::new(Arc::new(sender)), receiver)
    }

    fn drain(receiver: &mpsc::Receiver<WorkerMessage>) -> Vec<WorkerMessage> {
        receiver.try_iter().collect()
    }

    #[test]
    fn chunks_stream_immediately_and_accumulate() {
        let (bridge, receiver) = bridge();
        let key = RequestKey::from(3);
        let ((), output) = bridge.capture(&key, || {
            bridge.forward(OutputStream::Stdout, "a");
            assert_eq!(drain(&receiver).len(), 1);
            bridge.forward(OutputStream::Stderr, "warn");
            bridge.forward(OutputStream::Stdout, "b");
        });
        assert_eq!(
            output,
            CapturedOutput {
                stdout: "ab".to_owned(),
                stderr: "warn".to_owned(),
            }
        );
        assert_eq!(
            drain(&receiver),
            vec![
                WorkerMessage::reply(key.clone(), Reply::chunk(OutputStream::Stderr, "warn")),
                WorkerMessage::reply(key, Reply::chunk(OutputStream::Stdout, "b")),
            ]
        );
        assert_eq!(bridge.depth(), 0);
    }

    #[test]
    fn output_without_capture_is_not_forwarded() {
        let (bridge, receiver) = bridge();
        bridge.forward(OutputStream::Stdout, "ignored");
        assert!(drain(&receiver).is_empty());
    }

    #[test]
    fn nested_captures_share_chunks_and_use_innermost_key() {
        let (bridge, receiver) = bridge();
        let outer = RequestKey::from(1);
        let inner = RequestKey::from(2);
        let (inner_output, outer_output) = bridge.capture(&outer, || {
            bridge.forward(OutputStream::Stdout, "x");
            let ((), inner_output) = bridge.capture(&inner, || {
                bridge.forward(OutputStream::Stdout, "y");
            });
            inner_output
        });
        assert_eq!(inner_output.stdout, "y");
        assert_eq!(outer_output.stdout, "xy");
        let keys: Vec<RequestKey> = drain(&receiver)
            .into_iter()
            .filter_map(|message| match message {
                WorkerMessage::Reply(envelope) => Some(envelope.key),
                WorkerMessage::Lifecycle(_) => None,
            })
            .collect();
        assert_eq!(keys, vec![outer, inner]);
    }

    #[test]
    fn capture_closes_when_call_panics() {
        let (bridge, _receiver) = bridge();
        let key = RequestKey::from(5);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            bridge.capture(&key, || -> u8 { panic!("module trap") })
        }));
        assert!(result.is_err());
        assert_eq!(bridge.depth(), 0);
    }
}
