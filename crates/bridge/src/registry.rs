use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::protocol::{Reply, ReplyKind, RequestKey};

pub type ReplyResult = Result<Reply, ClientError>;

struct PendingRequest {
    key: RequestKey,
    expected: ReplyKind,
    resolver: oneshot::Sender<ReplyResult>,
}

impl PendingRequest {
    fn accepts(&self, key: &RequestKey, reply: &Reply) -> bool {
        if &self.key != key || !reply.is_terminal() {
            return false;
        }
        let kind = reply.kind();
        kind == self.expected || kind == ReplyKind::Error
    }
}

/// Outstanding requests of one controller, keyed by a monotonically
/// increasing counter.
#[derive(Default)]
pub struct CorrelationRegistry {
    next_key: u64,
    pending: Vec<PendingRequest>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh key and records a request that completes with a
    /// reply of `expected` kind, or with an error reply.
    pub fn register(
        &mut self,
        expected: ReplyKind,
    ) -> (RequestKey, oneshot::Receiver<ReplyResult>) {
        let key = RequestKey::from(self.next_key);
        self.next_key += 1;
        let (resolver, receiver) = oneshot::channel();
        self.pending.push(PendingRequest {
            key: key.clone(),
            expected,
            resolver,
        });
        (key, receiver)
    }

    /// Fulfills the first pending request that accepts this reply. The reply
    /// is handed back when nothing was waiting for it.
    pub fn resolve(&mut self, key: &RequestKey, reply: Reply) -> Result<(), Reply> {
        let Some(idx) = self
            .pending
            .iter()
            .position(|pending| pending.accepts(key, &reply))
        else {
            return Err(reply);
        };
        let pending = self.pending.remove(idx);
        if pending.resolver.send(Ok(reply)).is_err() {
            tracing::debug!(key = %key, "caller stopped listening before its reply arrived");
        }
        Ok(())
    }

    /// Drops a request that never made it onto the channel.
    pub fn forget(&mut self, key: &RequestKey) -> bool {
        let before = self.pending.len();
        self.pending.retain(|pending| &pending.key != key);
        before != self.pending.len()
    }

    /// Fails every outstanding request with `error`. Returns how many there were.
    pub fn reject_all(&mut self, error: &ClientError) -> usize {
        let rejected = self.pending.len();
        for pending in self.pending.drain(..) {
            let _ = pending.resolver.send(Err(error.clone()));
        }
        rejected
    }

    pub fn is_pending(&self, key: &RequestKey) -> bool {
        self.pending.iter().any(|pending| &pending.key == key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
