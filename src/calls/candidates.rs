use peerlink_core::envelope::IceCandidate;
use std::collections::VecDeque;

/// FIFO buffer for candidates that arrive before they can be used.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    queue: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Remove and return everything in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
