//! Job status model shared between the event dispatcher and callers.
//!
//! [`JobState`] is the lifecycle state machine's value; [`JobStatus`] is
//! the snapshot handed to callers and observers. The internal
//! [`StatusStore`] is the single mutable cell behind the tracker's lock:
//! every field of a snapshot corresponds to exactly one processed frame,
//! never a mix of two.

use serde::Serialize;

/// Lifecycle state of a submitted job.
///
/// `fail` is reserved for submission-time failures (the job was never
/// accepted by the server); `error` is reached via the event stream or a
/// transport failure on the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Initial state; also the state right after `submit()` resets.
    Pending,
    /// Accepted by the server, waiting in the execution queue.
    Queued,
    /// Nodes are executing.
    Processing,
    /// Execution finished; `outputs` holds everything collected.
    Completed,
    /// The server reported an execution error, or the connection broke.
    Error,
    /// The submission call itself failed; no event channel was opened.
    Fail,
    /// No terminal event arrived within the caller's wait budget.
    TimedOut,
}

impl JobState {
    /// True for states that permit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Error | JobState::Fail | JobState::TimedOut
        )
    }
}

/// Snapshot of a job's tracked status.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Current lifecycle state.
    pub state: JobState,
    /// The last inbound event payload that caused a transition, kept
    /// verbatim for diagnostics. `None` for synthetic transitions
    /// (timeout, transport failure before any frame).
    pub raw_event: Option<serde_json::Value>,
    /// Per-node output records, in arrival order. Append-only until a
    /// terminal state freezes them.
    pub outputs: Vec<serde_json::Value>,
    /// Error detail for `error` / `fail` states.
    pub error: Option<String>,
}

impl JobStatus {
    fn initial() -> Self {
        Self {
            state: JobState::Pending,
            raw_event: None,
            outputs: Vec::new(),
            error: None,
        }
    }
}

/// The mutable status cell. Owned by the tracker, accessed only under
/// its mutex; the version counter lets waiters detect transitions that
/// happened while they were between checks.
pub(crate) struct StatusStore {
    status: JobStatus,
    version: u64,
}

impl StatusStore {
    pub(crate) fn new() -> Self {
        Self {
            status: JobStatus::initial(),
            version: 0,
        }
    }

    /// Reinitialize for a fresh submission: back to `pending` with empty
    /// outputs. Not a transition -- observers are not told about it.
    pub(crate) fn reset(&mut self) {
        self.status = JobStatus::initial();
    }

    pub(crate) fn state(&self) -> JobState {
        self.status.state
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn snapshot(&self) -> JobStatus {
        self.status.clone()
    }

    /// Apply a state transition caused by one event.
    ///
    /// Returns `false` without touching anything if a terminal state has
    /// already been reached (terminal states are absorbing).
    pub(crate) fn transition(
        &mut self,
        state: JobState,
        raw_event: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        if self.status.state.is_terminal() {
            return false;
        }
        self.status.state = state;
        self.status.raw_event = raw_event;
        self.status.error = error;
        self.version += 1;
        true
    }

    /// Append a per-node output record. No-op once terminal.
    pub(crate) fn push_output(&mut self, output: serde_json::Value) -> bool {
        if self.status.state.is_terminal() {
            return false;
        }
        self.status.outputs.push(output);
        true
    }
}
