//! Holds remote candidates until the connection can accept them.
//!
//! Candidates commonly arrive before the offer or answer they belong to has
//! been applied. They are queued in arrival order and applied in that order
//! once the remote description is in place.

use std::collections::VecDeque;

use lanline_proto::IceCandidate;
use tracing::{debug, warn};

use crate::peer::PeerLink;

/// What happened to a candidate handed to [`IceCandidateBuffer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Queued,
    Applied,
    /// Applying failed; the candidate is back in the queue.
    Requeued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    queue: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Apply the candidate now if the connection has its remote description,
    /// otherwise queue it. Previously requeued candidates are retried first so
    /// arrival order is kept.
    pub async fn add(
        &mut self,
        link: Option<&dyn PeerLink>,
        candidate: IceCandidate,
    ) -> CandidateDisposition {
        let link = match link {
            Some(link) if self.remote_description_set => link,
            _ => {
                self.queue.push_back(candidate);
                return CandidateDisposition::Queued;
            }
        };
        if !link.has_remote_description().await {
            self.queue.push_back(candidate);
            return CandidateDisposition::Queued;
        }

        self.queue.push_back(candidate);
        let mut retained = VecDeque::new();
        while let Some(next) = self.queue.pop_front() {
            if let Err(err) = link.add_ice_candidate(&next).await {
                warn!(error = %err, candidate = %next.candidate, "failed to add candidate; re-queued");
                retained.push_back(next);
            }
        }
        self.queue = retained;
        if self.queue.is_empty() {
            CandidateDisposition::Applied
        } else {
            CandidateDisposition::Requeued
        }
    }

    pub fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    /// Apply every queued candidate in arrival order. A failing candidate is
    /// logged and dropped; the rest are still applied.
    pub async fn flush(&mut self, link: &dyn PeerLink) -> FlushReport {
        let mut report = FlushReport::default();
        for candidate in std::mem::take(&mut self.queue) {
            match link.add_ice_candidate(&candidate).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(error = %err, candidate = %candidate.candidate, "failed to add queued candidate");
                }
            }
        }
        debug!(
            applied = report.applied,
            failed = report.failed,
            "flushed queued candidates"
        );
        report
    }
}
