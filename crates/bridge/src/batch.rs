use serde_json::Value;

use crate::client::ModuleClient;
use crate::error::ClientError;
use crate::protocol::{Reply, ReplyKind, Request};

/// Collects requests that travel to the worker as a single `batch` request.
///
/// The worker executes them in order and answers with one reply per
/// request. Output of the sub-requests streams under the batch key.
#[must_use = "a batch does nothing until it is sent"]
pub struct BatchBuilder<'a> {
    client: &'a ModuleClient,
    requests: Vec<Request>,
}

impl<'a> BatchBuilder<'a> {
    pub(crate) fn new(client: &'a ModuleClient) -> Self {
        Self {
            client,
            requests: Vec::new(),
        }
    }

    pub fn push(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    pub fn run(self, args: &[&str], stdin: Option<&str>) -> Self {
        self.push(Request::Run {
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            stdin: stdin.map(str::to_owned),
        })
    }

    pub fn call(self, function: &str, args: Vec<Value>) -> Self {
        self.push(Request::CallFunction {
            function: function.to_owned(),
            args,
        })
    }

    pub fn set_env(self, name: &str, value: &str) -> Self {
        self.push(Request::SetEnv {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }

    pub fn push_stdin(self, chunk: &str) -> Self {
        self.push(Request::PushStdin {
            chunk: chunk.to_owned(),
        })
    }

    pub fn clear_stdin(self) -> Self {
        self.push(Request::ClearStdin)
    }

    pub fn write_text_file(self, path: &str, content: &str) -> Self {
        self.push(Request::WriteTextFile {
            path: path.to_owned(),
            content: content.to_owned(),
        })
    }

    pub fn write_binary_file(self, path: &str, content: Vec<u8>) -> Self {
        self.push(Request::WriteBinaryFile {
            path: path.to_owned(),
            content,
        })
    }

    pub fn read_text_file(self, path: &str) -> Self {
        self.push(Request::ReadTextFile {
            path: path.to_owned(),
        })
    }

    pub fn read_binary_file(self, path: &str) -> Self {
        self.push(Request::ReadBinaryFile {
            path: path.to_owned(),
        })
    }

    pub fn ensure_dir(self, path: &str) -> Self {
        self.push(Request::EnsureDirectory {
            path: path.to_owned(),
        })
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Sends the batch and returns the replies in request order. Failed
    /// sub-requests show up as `Reply::Error` entries.
    pub async fn send(self) -> Result<Vec<Reply>, ClientError> {
        let sent = self.requests.len();
        let reply = self
            .client
            .request(Request::Batch {
                requests: self.requests,
            })
            .await?;
        match reply {
            Reply::Batch { replies } if replies.len() == sent => Ok(replies),
            Reply::Batch { replies } => Err(ClientError::BatchMismatch {
                sent,
                received: replies.len(),
            }),
            other => Err(ClientError::UnexpectedReply {
                expected: ReplyKind::Batch,
                received: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::client::ClientOptions;
    use crate::protocol::WorkerMessage;
    use crate::transport::ControllerEnd;

    fn connect() -> (
        ModuleClient,
        mpsc::Receiver<crate::protocol::RequestEnvelope>,
        mpsc::Sender<WorkerMessage>,
    ) {
        let (request_sender, request_receiver) = mpsc::channel();
        let (reply_sender, reply_receiver) = mpsc::channel();
        let end = ControllerEnd {
            outbound: Box::new(request_sender),
            inbound: Box::new(reply_receiver),
        };
        let client = ModuleClient::connect(end, ClientOptions::default(), None).unwrap();
        (client, request_receiver, reply_sender)
    }

    #[test]
    fn builder_keeps_request_order() {
        let (client, _requests, _replies) = connect();
        let batch = client
            .batch()
            .ensure_dir("/data")
            .write_text_file("/data/a.txt", "hi")
            .read_text_file("/data/a.txt");
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.requests.iter().map(Request::kind).collect::<Vec<_>>(),
            vec![
                crate::protocol::RequestKind::EnsureDirectory,
                crate::protocol::RequestKind::WriteTextFile,
                crate::protocol::RequestKind::ReadTextFile,
            ]
        );
    }

    #[tokio::test]
    async fn short_batch_reply_is_a_mismatch() {
        let (client, requests, replies) = connect();
        let pending = client.batch().clear_stdin().clear_stdin().send();
        let answer = async {
            let request = tokio::task::spawn_blocking(move || requests.recv().unwrap())
                .await
                .unwrap();
            replies
                .send(WorkerMessage::reply(
                    request.key,
                    Reply::Batch {
                        replies: vec![Reply::Ok],
                    },
                ))
                .unwrap();
        };
        let (result, ()) = tokio::join!(pending, answer);
        assert_eq!(
            result,
            Err(ClientError::BatchMismatch {
                sent: 2,
                received: 1,
            })
        );
    }
}
