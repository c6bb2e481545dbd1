use std::collections::VecDeque;

use super::IceCandidate;

/// Candidates that arrived before the remote description was set.
///
/// Strictly FIFO. Drained exactly once, when the remote description becomes
/// available; after that the queue refuses new entries because candidates
/// are applied directly.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl IceCandidateQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate; returns it back if the queue was already drained
    pub fn push(&mut self, candidate: IceCandidate) -> Result<(), IceCandidate> {
        if self.drained {
            return Err(candidate);
        }
        self.pending.push_back(candidate);
        Ok(())
    }

    /// Take every buffered candidate in arrival order and retire the queue
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.drained = true;
        self.pending.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.drained
    }
}
