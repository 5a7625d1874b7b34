//! Changefeed state facade
//!
//! The metadata store (etcd semantics: watchable keys, optimistic
//! patches) lives outside this crate. The owner works against this
//! in-memory image of one changefeed's keys and mutates it exclusively
//! through patch closures, the same discipline the store's
//! compare-and-swap transactions impose; the external reconciler ships
//! changed records back to the store.

use std::collections::HashMap;

use crate::model::{
    CaptureId, ChangeFeedInfo, ChangeFeedStatus, ChangefeedId, TaskPosition, TaskStatus,
    TaskWorkload,
};

/// In-memory image of one changefeed's records in the metadata store.
#[derive(Debug)]
pub struct ChangefeedState {
    pub id: ChangefeedId,
    pub info: ChangeFeedInfo,
    pub status: Option<ChangeFeedStatus>,
    pub task_statuses: HashMap<CaptureId, TaskStatus>,
    pub task_positions: HashMap<CaptureId, TaskPosition>,
    pub workloads: HashMap<CaptureId, TaskWorkload>,
}

impl ChangefeedState {
    pub fn new(id: impl Into<ChangefeedId>, info: ChangeFeedInfo) -> Self {
        Self {
            id: id.into(),
            info,
            status: None,
            task_statuses: HashMap::new(),
            task_positions: HashMap::new(),
            workloads: HashMap::new(),
        }
    }

    /// Patch the status record. The closure receives the current value
    /// and returns the new value plus whether anything changed.
    pub fn patch_status<F>(&mut self, f: F) -> bool
    where
        F: FnOnce(Option<ChangeFeedStatus>) -> (Option<ChangeFeedStatus>, bool),
    {
        let (next, changed) = f(self.status);
        if changed {
            self.status = next;
        }
        changed
    }

    pub fn patch_task_status<F>(&mut self, capture: &CaptureId, f: F) -> bool
    where
        F: FnOnce(Option<TaskStatus>) -> (Option<TaskStatus>, bool),
    {
        let current = self.task_statuses.get(capture).cloned();
        let (next, changed) = f(current);
        if changed {
            match next {
                Some(status) => {
                    self.task_statuses.insert(capture.clone(), status);
                }
                None => {
                    self.task_statuses.remove(capture);
                }
            }
        }
        changed
    }

    pub fn patch_task_position<F>(&mut self, capture: &CaptureId, f: F) -> bool
    where
        F: FnOnce(Option<TaskPosition>) -> (Option<TaskPosition>, bool),
    {
        let current = self.task_positions.get(capture).cloned();
        let (next, changed) = f(current);
        if changed {
            match next {
                Some(position) => {
                    self.task_positions.insert(capture.clone(), position);
                }
                None => {
                    self.task_positions.remove(capture);
                }
            }
        }
        changed
    }

    pub fn patch_task_workload<F>(&mut self, capture: &CaptureId, f: F) -> bool
    where
        F: FnOnce(Option<TaskWorkload>) -> (Option<TaskWorkload>, bool),
    {
        let current = self.workloads.get(capture).cloned();
        let (next, changed) = f(current);
        if changed {
            match next {
                Some(workload) => {
                    self.workloads.insert(capture.clone(), workload);
                }
                None => {
                    self.workloads.remove(capture);
                }
            }
        }
        changed
    }
}
