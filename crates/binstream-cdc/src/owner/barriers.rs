//! Barrier bookkeeping
//!
//! The owner refuses to advance the global checkpoint past a barrier
//! until its side effect is durable. Three barrier kinds exist; the
//! owner always acts on the minimum.

use crate::model::Ts;

/// What a barrier is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierType {
    /// A DDL job must be applied downstream first.
    DdlJob,
    /// A sync point must be recorded downstream.
    SyncPoint,
    /// The changefeed reaches its target ts and finishes.
    Finish,
}

/// The owner's barrier set. Barrier ts values are monotone
/// non-decreasing per type.
#[derive(Debug, Default)]
pub struct Barriers {
    ddl_job: Option<Ts>,
    sync_point: Option<Ts>,
    finish: Option<Ts>,
}

impl Barriers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, tp: BarrierType, ts: Ts) {
        let slot = match tp {
            BarrierType::DdlJob => &mut self.ddl_job,
            BarrierType::SyncPoint => &mut self.sync_point,
            BarrierType::Finish => &mut self.finish,
        };
        *slot = Some(ts);
    }

    pub fn remove(&mut self, tp: BarrierType) {
        match tp {
            BarrierType::DdlJob => self.ddl_job = None,
            BarrierType::SyncPoint => self.sync_point = None,
            BarrierType::Finish => self.finish = None,
        }
    }

    /// The smallest active barrier. At least one barrier must be set
    /// (the owner always seeds the finish barrier).
    pub fn min(&self) -> (BarrierType, Ts) {
        let candidates = [
            (BarrierType::DdlJob, self.ddl_job),
            (BarrierType::SyncPoint, self.sync_point),
            (BarrierType::Finish, self.finish),
        ];
        candidates
            .into_iter()
            .filter_map(|(tp, ts)| ts.map(|ts| (tp, ts)))
            .min_by_key(|&(_, ts)| ts)
            .expect("no barrier set")
    }
}
