use std::fmt;

use guest::{Environment, OutputStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates one request with its streamed chunks and its terminal reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for RequestKey {
    fn from(counter: u64) -> Self {
        Self(counter.to_string())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Request {
    Run {
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdin: Option<String>,
    },
    CallFunction {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    SetEnv {
        name: String,
        value: String,
    },
    PushStdin {
        chunk: String,
    },
    ClearStdin,
    WriteTextFile {
        path: String,
        content: String,
    },
    WriteBinaryFile {
        path: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    ReadTextFile {
        path: String,
    },
    ReadBinaryFile {
        path: String,
    },
    EnsureDirectory {
        path: String,
    },
    Batch {
        requests: Vec<Request>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    Run,
    CallFunction,
    SetEnv,
    PushStdin,
    ClearStdin,
    WriteTextFile,
    WriteBinaryFile,
    ReadTextFile,
    ReadBinaryFile,
    EnsureDirectory,
    Batch,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Run { .. } => RequestKind::Run,
            Self::CallFunction { .. } => RequestKind::CallFunction,
            Self::SetEnv { .. } => RequestKind::SetEnv,
            Self::PushStdin { .. } => RequestKind::PushStdin,
            Self::ClearStdin => RequestKind::ClearStdin,
            Self::WriteTextFile { .. } => RequestKind::WriteTextFile,
            Self::WriteBinaryFile { .. } => RequestKind::WriteBinaryFile,
            Self::ReadTextFile { .. } => RequestKind::ReadTextFile,
            Self::ReadBinaryFile { .. } => RequestKind::ReadBinaryFile,
            Self::EnsureDirectory { .. } => RequestKind::EnsureDirectory,
            Self::Batch { .. } => RequestKind::Batch,
        }
    }
}

impl RequestKind {
    /// The terminal reply kind a successful request of this kind ends with.
    pub fn terminal_reply(self) -> ReplyKind {
        match self {
            Self::Run => ReplyKind::Run,
            Self::CallFunction => ReplyKind::CallFunction,
            Self::ReadTextFile => ReplyKind::ReadTextFile,
            Self::ReadBinaryFile => ReplyKind::ReadBinaryFile,
            Self::Batch => ReplyKind::Batch,
            Self::SetEnv
            | Self::PushStdin
            | Self::ClearStdin
            | Self::WriteTextFile
            | Self::WriteBinaryFile
            | Self::EnsureDirectory => ReplyKind::Ok,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An error raised on the worker side, with whatever output it produced first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Reply {
    Ok,
    Run(RunResult),
    CallFunction {
        function: String,
        return_value: Value,
    },
    ReadTextFile {
        path: String,
        content: String,
    },
    ReadBinaryFile {
        path: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    Batch {
        replies: Vec<Reply>,
    },
    StdoutChunk {
        chunk: String,
    },
    StderrChunk {
        chunk: String,
    },
    Error(RemoteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyKind {
    Ok,
    Run,
    CallFunction,
    ReadTextFile,
    ReadBinaryFile,
    Batch,
    StdoutChunk,
    StderrChunk,
    Error,
}

impl Reply {
    pub fn chunk(stream: OutputStream, chunk: impl Into<String>) -> Self {
        let chunk = chunk.into();
        match stream {
            OutputStream::Stdout => Self::StdoutChunk { chunk },
            OutputStream::Stderr => Self::StderrChunk { chunk },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(RemoteError::new(message))
    }

    pub fn kind(&self) -> ReplyKind {
        match self {
            Self::Ok => ReplyKind::Ok,
            Self::Run(_) => ReplyKind::Run,
            Self::CallFunction { .. } => ReplyKind::CallFunction,
            Self::ReadTextFile { .. } => ReplyKind::ReadTextFile,
            Self::ReadBinaryFile { .. } => ReplyKind::ReadBinaryFile,
            Self::Batch { .. } => ReplyKind::Batch,
            Self::StdoutChunk { .. } => ReplyKind::StdoutChunk,
            Self::StderrChunk { .. } => ReplyKind::StderrChunk,
            Self::Error(_) => ReplyKind::Error,
        }
    }

    /// Streamed chunks are the only replies that do not end a request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StdoutChunk { .. } | Self::StderrChunk { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub key: RequestKey,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub key: RequestKey,
    #[serde(flatten)]
    pub reply: Reply,
}

/// Unsolicited notifications about the module itself. They carry no key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Ready {
        #[serde(default)]
        environment: Environment,
    },
    Exit {
        code: i32,
    },
    Quit {
        status: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Reply(ReplyEnvelope),
    Lifecycle(LifecycleEvent),
}

impl WorkerMessage {
    pub fn reply(key: RequestKey, reply: Reply) -> Self {
        Self::Reply(ReplyEnvelope { key, reply })
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
