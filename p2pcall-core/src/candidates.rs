//! Early candidate buffering
//!
//! Candidates can overtake the description they belong to. Until the remote
//! description is applied they wait here, in arrival order.

use crate::media::IceCandidate;
use std::collections::VecDeque;

/// FIFO of candidates received before the remote description
///
/// Flushed exactly once. After [`CandidateQueue::take_for_flush`] the queue is
/// sealed and refuses further pushes, since later candidates go straight to
/// the media link.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    flushed: bool,
}

impl CandidateQueue {
    /// Empty, unsealed queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate
    ///
    /// Returns the candidate back if the queue was already flushed.
    pub fn push(&mut self, candidate: IceCandidate) -> Result<(), IceCandidate> {
        if self.flushed {
            return Err(candidate);
        }
        self.pending.push_back(candidate);
        Ok(())
    }

    /// Hand over every buffered candidate in arrival order and seal the queue
    ///
    /// A second call yields nothing.
    pub fn take_for_flush(&mut self) -> Vec<IceCandidate> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;
        self.pending.drain(..).collect()
    }

    /// Drop everything buffered and seal the queue
    pub fn clear(&mut self) {
        self.pending.clear();
        self.flushed = true;
    }

    /// Number of buffered candidates
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Nothing buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
