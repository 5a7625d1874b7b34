//! Feed state management
//!
//! Converts admin jobs and thrown errors into changefeed state
//! transitions: fast-fail errors mark the feed failed with no retry,
//! other errors move it to the error state for a later resume, and
//! pause / resume / remove requests patch both the info and status
//! records.

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::error::CdcError;
use crate::model::{AdminJobType, FeedState, RunningError};
use crate::state::ChangefeedState;

/// Per-changefeed state machine driver.
#[derive(Debug, Default)]
pub struct FeedStateManager {
    should_running: bool,
    should_removed: bool,
    admin_jobs: VecDeque<AdminJobType>,
}

impl FeedStateManager {
    pub fn new() -> Self {
        Self {
            should_running: true,
            ..Default::default()
        }
    }

    /// Queue an admin request; applied on the next tick.
    pub fn push_admin_job(&mut self, job: AdminJobType) {
        self.admin_jobs.push_back(job);
    }

    /// Apply pending admin jobs and derive whether the feed should run.
    pub fn tick(&mut self, state: &mut ChangefeedState) {
        while let Some(job) = self.admin_jobs.pop_front() {
            self.handle_admin_job(state, job);
        }
        self.should_running = matches!(state.info.state, FeedState::Normal | FeedState::Error);
    }

    pub fn should_running(&self) -> bool {
        self.should_running
    }

    pub fn should_removed(&self) -> bool {
        self.should_removed
    }

    /// The feed reached its target ts.
    pub fn mark_finished(&mut self, state: &mut ChangefeedState) {
        info!(changefeed = %state.id, "changefeed finished");
        state.info.state = FeedState::Finished;
        state.patch_status(|status| match status {
            Some(mut status) => {
                status.admin_job_type = AdminJobType::Finish;
                (Some(status), true)
            }
            None => (None, false),
        });
        self.should_running = false;
    }

    /// Convert a thrown error into a state transition.
    pub fn handle_error(&mut self, state: &mut ChangefeedState, err: &CdcError, addr: &str) {
        let running_error = RunningError {
            addr: addr.to_string(),
            code: error_code(err),
            message: err.to_string(),
        };
        state.info.error = Some(running_error);
        if err.is_fast_fail() {
            warn!(changefeed = %state.id, error = %err, "changefeed failed, no retry");
            state.info.state = FeedState::Failed;
            self.should_running = false;
        } else {
            warn!(changefeed = %state.id, error = %err, "changefeed in error state");
            state.info.state = FeedState::Error;
        }
    }

    fn handle_admin_job(&mut self, state: &mut ChangefeedState, job: AdminJobType) {
        info!(changefeed = %state.id, ?job, "handle admin job");
        match job {
            AdminJobType::None => {}
            AdminJobType::Pause => {
                state.info.state = FeedState::Stopped;
            }
            AdminJobType::Resume => {
                state.info.state = FeedState::Normal;
                state.info.error = None;
            }
            AdminJobType::Remove => {
                state.info.state = FeedState::Removed;
                self.should_removed = true;
            }
            AdminJobType::Finish => {
                state.info.state = FeedState::Finished;
            }
        }
        state.patch_status(|status| match status {
            Some(mut status) => {
                status.admin_job_type = job;
                (Some(status), true)
            }
            None => (None, false),
        });
    }
}

fn error_code(err: &CdcError) -> String {
    match err {
        CdcError::GcTtlExceeded { .. } => "CDC:ErrGCTTLExceeded",
        CdcError::StartTsBeforeGc { .. } => "CDC:ErrStartTsBeforeGC",
        CdcError::ExecDdlFailed(_) => "CDC:ErrExecDDLFailed",
        CdcError::Sink(_) => "CDC:ErrSink",
        CdcError::Puller(_) => "CDC:ErrPuller",
        _ => "CDC:ErrOwnerUnknown",
    }
    .to_string()
}
