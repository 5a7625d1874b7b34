//! Per-table flow control
//!
//! The sorter admits events against a byte quota; the sink releases the
//! bytes once everything at or below a resolved ts has been flushed
//! downstream. When the quota is exhausted the puller→sorter adapter gets
//! `false` back and the actor retries on a later tick, which is the
//! pipeline's only backpressure mechanism.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::model::Ts;

#[derive(Debug, Default)]
struct FlowInner {
    consumed: u64,
    /// Bytes consumed per commit ts, oldest first.
    batches: VecDeque<(Ts, u64)>,
}

/// Byte-budget flow controller shared by the sorter (consume) and sink
/// (release) of one table pipeline.
#[derive(Debug)]
pub struct TableFlowController {
    quota: u64,
    inner: Mutex<FlowInner>,
}

impl TableFlowController {
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            inner: Mutex::new(FlowInner::default()),
        }
    }

    /// Try to admit `bytes` for an event committing at `commit_ts`.
    /// Returns `false` without consuming anything when the quota would be
    /// exceeded — unless nothing is consumed yet, in which case one
    /// oversized event is admitted so the pipeline cannot deadlock.
    pub fn try_consume(&self, commit_ts: Ts, bytes: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.consumed + bytes > self.quota && inner.consumed > 0 {
            return false;
        }
        inner.consumed += bytes;
        inner.batches.push_back((commit_ts, bytes));
        true
    }

    /// Release everything consumed at or below `resolved_ts`.
    pub fn release(&self, resolved_ts: Ts) {
        let mut inner = self.inner.lock();
        while let Some(&(ts, bytes)) = inner.batches.front() {
            if ts > resolved_ts {
                break;
            }
            inner.consumed = inner.consumed.saturating_sub(bytes);
            inner.batches.pop_front();
        }
    }

    pub fn consumed(&self) -> u64 {
        self.inner.lock().consumed
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }
}
