use std::sync::{Arc, Mutex, Weak};

use crate::config::canonical_channel;
use crate::resolve::{Claim, ResolveError};

/// The pool queue type carrying transcoding requests.
pub type VideoQueue = mfr::Queue<Arc<TranscodingRequest>>;

/// A resolved transcoding request. Identified by its `sd_hash` fingerprint
/// everywhere except user-facing surfaces, which use the URI.
///
/// Once admitted, the request holds a weak handle to its owning queue so
/// that workers can drive its lifecycle: [`release`](Self::release) when
/// declining without finishing, [`reject`](Self::reject) on fatal failure,
/// [`complete`](Self::complete) when the artifact is recorded.
#[derive(Debug)]
pub struct TranscodingRequest {
    pub uri: String,
    pub sd_hash: String,
    pub name: String,
    pub normalized_name: String,
    pub claim_id: String,
    /// Canonical channel URI (lower-case, `#` → `:`).
    pub channel_uri: String,
    /// Whole tokens of support behind the signing channel.
    pub channel_support_amount: i64,

    queue: Mutex<Option<Weak<VideoQueue>>>,
}

impl TranscodingRequest {
    pub fn from_claim(uri: &str, claim: &Claim) -> Result<Self, ResolveError> {
        let Some(channel) = &claim.signing_channel else {
            return Err(ResolveError::NoSigningChannel);
        };
        let sd_hash = claim
            .value
            .as_ref()
            .and_then(|v| v.source.as_ref())
            .map(|s| s.sd_hash.to_lowercase())
            .filter(|h| !h.is_empty())
            .ok_or(ResolveError::NoSource)?;

        Ok(Self {
            uri: uri.to_string(),
            sd_hash,
            name: claim.name.clone(),
            normalized_name: claim.normalized_name.clone(),
            claim_id: claim.claim_id.clone(),
            channel_uri: canonical_channel(&channel.canonical_url),
            channel_support_amount: claim.support_amount(),
            queue: Mutex::new(None),
        })
    }

    /// Point this request at its owning queue. Called by the accepting
    /// admission predicate.
    pub(crate) fn attach_queue(&self, queue: &Arc<VideoQueue>) {
        *self.queue.lock().unwrap() = Some(Arc::downgrade(queue));
    }

    fn owning_queue(&self) -> Option<Arc<VideoQueue>> {
        self.queue.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Put the request back into its queue without finishing it.
    pub fn release(&self) {
        let Some(queue) = self.owning_queue() else {
            return;
        };
        tracing::info!(uri = %self.uri, "transcoding request released");
        queue.release(&self.sd_hash);
    }

    /// Mark the request done without an artifact (fatal failure).
    pub fn reject(&self) {
        let Some(queue) = self.take_queue() else {
            return;
        };
        tracing::info!(uri = %self.uri, "transcoding request rejected");
        queue.done(&self.sd_hash);
    }

    /// Mark the request done with its artifact recorded.
    pub fn complete(&self) {
        let Some(queue) = self.take_queue() else {
            return;
        };
        tracing::info!(uri = %self.uri, "transcoding request completed");
        queue.done(&self.sd_hash);
    }

    fn take_queue(&self) -> Option<Arc<VideoQueue>> {
        self.queue
            .lock()
            .unwrap()
            .take()
            .and_then(|weak| weak.upgrade())
    }
}
