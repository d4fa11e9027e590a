use std::io::{BufRead, BufWriter, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::protocol::{RequestEnvelope, RequestKey, WorkerMessage};

pub trait Outbound<M>: Send + Sync {
    fn post(&self, message: M) -> Result<(), TransportError>;
}

pub trait Inbound<M>: Send {
    /// Next message, or `None` once the other side has closed the channel.
    fn receive(&mut self) -> Result<Option<M>, TransportError>;
}

impl<M: Send> Outbound<M> for Sender<M> {
    fn post(&self, message: M) -> Result<(), TransportError> {
        self.send(message).map_err(|_| TransportError::Closed)
    }
}

impl<M: Send> Inbound<M> for Receiver<M> {
    fn receive(&mut self) -> Result<Option<M>, TransportError> {
        Ok(self.recv().ok())
    }
}

pub struct ControllerEnd {
    pub outbound: Box<dyn Outbound<RequestEnvelope>>,
    pub inbound: Box<dyn Inbound<WorkerMessage>>,
}

pub struct WorkerEnd {
    pub outbound: Box<dyn Outbound<WorkerMessage>>,
    pub inbound: Box<dyn Inbound<RequestEnvelope>>,
}

/// In-process channel pair. Messages are moved across, so binary buffers are
/// transferred without a copy.
pub fn thread_channel() -> (ControllerEnd, WorkerEnd) {
    let (request_sender, request_receiver) = mpsc::channel::<RequestEnvelope>();
    let (reply_sender, reply_receiver) = mpsc::channel::<WorkerMessage>();
    (
        ControllerEnd {
            outbound: Box::new(request_sender),
            inbound: Box::new(reply_receiver),
        },
        WorkerEnd {
            outbound: Box::new(reply_sender),
            inbound: Box::new(request_receiver),
        },
    )
}

/// Writes one JSON document per line and flushes after each.
pub struct JsonLineWriter<W: Write> {
    writer: Mutex<BufWriter<W>>,
}

impl<W: Write> JsonLineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }
}

impl<M, W> Outbound<M> for JsonLineWriter<W>
where
    M: Serialize,
    W: Write + Send,
{
    fn post(&self, message: M) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line).map_err(closed_on_broken_pipe)?;
        writer.flush().map_err(closed_on_broken_pipe)
    }
}

pub struct JsonLineReader<R: BufRead> {
    reader: R,
    line: String,
}

impl<R: BufRead> JsonLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl<M, R> Inbound<M> for JsonLineReader<R>
where
    M: DeserializeOwned,
    R: BufRead + Send,
{
    fn receive(&mut self) -> Result<Option<M>, TransportError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line)?;
            if read == 0 {
                return Ok(None);
            }
            let line = self.line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map(Some)
                .map_err(|err| TransportError::Malformed {
                    key: key_of(line),
                    reason: err.to_string(),
                });
        }
    }
}

fn key_of(line: &str) -> Option<RequestKey> {
    let value: Value = serde_json::from_str(line).ok()?;
    match value.get("key")? {
        Value::String(key) if !key.is_empty() => Some(RequestKey::new(key.clone())),
        _ => None,
    }
}

fn closed_on_broken_pipe(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::BrokenPipe {
        TransportError::Closed
    } else {
        TransportError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::protocol::{LifecycleEvent, Request};

    #[test]
    fn json_lines_skip_blank_lines_and_end_at_eof() {
        let input = "\n{\"key\":\"0\",\"kind\":\"clear-stdin\"}\n\n";
        let mut reader = JsonLineReader::new(Cursor::new(input));
        let first: Option<RequestEnvelope> = reader.receive().unwrap();
        assert_eq!(
            first,
            Some(RequestEnvelope {
                key: RequestKey::from(0),
                request: Request::ClearStdin,
            })
        );
        let end: Option<RequestEnvelope> = reader.receive().unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn unknown_kind_keeps_the_key() {
        let mut reader =
            JsonLineReader::new(Cursor::new("{\"key\":\"12\",\"kind\":\"teleport\"}\n"));
        let err = Inbound::<RequestEnvelope>::receive(&mut reader).unwrap_err();
        match err {
            TransportError::Malformed { key, .. } => assert_eq!(key, Some(RequestKey::from(12))),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn garbage_line_has_no_key() {
        let mut reader = JsonLineReader::new(Cursor::new("not json\n"));
        let err = Inbound::<RequestEnvelope>::receive(&mut reader).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, TransportError::Malformed { key: None, .. }));
    }

    #[test]
    fn writer_emits_one_line_per_message() {
        let writer = JsonLineWriter::new(Vec::new());
        writer
            .post(WorkerMessage::Lifecycle(LifecycleEvent::Exit { code: 0 }))
            .unwrap();
        writer
            .post(WorkerMessage::Lifecycle(LifecycleEvent::Exit { code: 1 }))
            .unwrap();
        let bytes = writer.writer.into_inner().unwrap().into_inner().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "{\"kind\":\"exit\",\"code\":0}\n{\"kind\":\"exit\",\"code\":1}\n"
        );
    }

    #[test]
    fn thread_channel_moves_messages_in_order() {
        let (controller, mut worker) = thread_channel();
        for key in 0..3u64 {
            controller
                .outbound
                .post(RequestEnvelope {
                    key: RequestKey::from(key),
                    request: Request::ClearStdin,
                })
                .unwrap();
        }
        drop(controller);
        let mut keys = Vec::new();
        while let Some(envelope) = worker.inbound.receive().unwrap() {
            keys.push(envelope.key);
        }
        assert_eq!(
            keys,
            vec![RequestKey::from(0), RequestKey::from(1), RequestKey::from(2)]
        );
    }
}
