//! Job submission and status-tracking facade.
//!
//! [`JobTracker`] submits one workflow at a time to a ComfyUI server,
//! opens a WebSocket event channel scoped to the submission's client
//! id, and maintains the job's [`JobStatus`] as events arrive. Callers
//! read the status with [`JobTracker::get_status`] (non-blocking) or
//! [`JobTracker::wait_for_status`] (suspends until the next transition
//! or a timeout).
//!
//! Concurrency model: exactly one background task (the event channel)
//! writes the status; any number of tasks may read or wait. The status
//! triple `{state, raw_event, outputs}` lives behind one mutex, so a
//! reader always sees the result of exactly one processed frame.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyApi, ComfyApiError};
use crate::channel;
use crate::config::ClientConfig;
use crate::observer::{NoopObserver, StatusObserver};
use crate::status::{JobState, JobStatus, StatusStore};

/// State shared between the facade, the event-channel task, and the
/// dispatcher. Transition methods here are the single write path into
/// the status store: mutate under the lock, then signal waiters, then
/// invoke the observer with the fresh snapshot.
pub(crate) struct TrackerState {
    store: Mutex<StatusStore>,
    signal: Notify,
    observer: Arc<dyn StatusObserver>,
    client_id: Mutex<Option<String>>,
    /// Token for the currently open event channel. Cancelling it closes
    /// the channel; cancelling twice is a no-op.
    cancel: Mutex<CancellationToken>,
}

impl TrackerState {
    fn new(observer: Arc<dyn StatusObserver>) -> Self {
        Self {
            store: Mutex::new(StatusStore::new()),
            signal: Notify::new(),
            observer,
            client_id: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Lock the store, recovering the data if a writer panicked.
    fn lock_store(&self) -> MutexGuard<'_, StatusStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_client_id(&self) -> MutexGuard<'_, Option<String>> {
        self.client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when `sid` names this tracker's current client id.
    pub(crate) fn is_own_session(&self, sid: Option<&str>) -> bool {
        match (&*self.lock_client_id(), sid) {
            (Some(own), Some(sid)) => own == sid,
            _ => false,
        }
    }

    /// Cancel the current event channel. Idempotent.
    pub(crate) fn close_channel(&self) {
        self.lock_cancel().cancel();
    }

    /// Run one mutation against the store; on change, optionally close
    /// the channel, then wake waiters and fire the observer.
    fn update(&self, mutate: impl FnOnce(&mut StatusStore) -> bool, close_channel: bool) {
        let (changed, snapshot) = {
            let mut store = self.lock_store();
            let changed = mutate(&mut store);
            (changed, store.snapshot())
        };
        if !changed {
            return;
        }
        if close_channel {
            self.close_channel();
        }
        self.signal.notify_waiters();
        self.observer.on_status_changed(&snapshot);
    }

    /// Queue-depth says other prompts are still ahead of ours.
    pub(crate) fn queue(&self, raw: serde_json::Value) {
        self.update(move |s| s.transition(JobState::Queued, Some(raw), None), false);
    }

    /// Generic progress: a node is executing or reported step progress.
    pub(crate) fn progress(&self, raw: serde_json::Value) {
        self.update(
            move |s| s.transition(JobState::Processing, Some(raw), None),
            false,
        );
    }

    /// A node finished with output: append it and stay in `processing`.
    pub(crate) fn record_output(&self, output: serde_json::Value, raw: serde_json::Value) {
        self.update(
            move |s| {
                if !s.push_output(output) {
                    return false;
                }
                s.transition(JobState::Processing, Some(raw), None)
            },
            false,
        );
    }

    /// Terminal success: freeze outputs and close the channel.
    pub(crate) fn complete(&self, raw: serde_json::Value) {
        self.update(
            move |s| s.transition(JobState::Completed, Some(raw), None),
            true,
        );
    }

    /// Terminal server-reported error.
    pub(crate) fn server_error(&self, detail: String, raw: serde_json::Value) {
        self.update(
            move |s| s.transition(JobState::Error, Some(raw), Some(detail)),
            true,
        );
    }

    /// Terminal transport-level error on the live connection.
    pub(crate) fn channel_error(&self, detail: String) {
        self.update(move |s| s.transition(JobState::Error, None, Some(detail)), true);
    }

    /// Terminal submission/connect failure; no channel stays open.
    pub(crate) fn fail(&self, detail: String, raw: Option<serde_json::Value>) {
        self.update(move |s| s.transition(JobState::Fail, raw, Some(detail)), true);
    }

    /// Force `timed_out` unless a terminal state won the race first.
    /// Returns the status after the attempt either way.
    fn force_timeout(&self) -> JobStatus {
        let (changed, snapshot) = {
            let mut store = self.lock_store();
            let changed = store.transition(JobState::TimedOut, None, None);
            (changed, store.snapshot())
        };
        if changed {
            self.close_channel();
            self.signal.notify_waiters();
            self.observer.on_status_changed(&snapshot);
        }
        snapshot
    }
}

/// Tracks one ComfyUI job from submission to terminal outcome.
///
/// One `JobTracker` owns at most one live event channel. Calling
/// [`submit`](Self::submit) again while a previous channel is still
/// open is not supported: wait for a terminal state (or call
/// [`close`](Self::close)) before resubmitting. Concurrent `submit`
/// calls on the same tracker are a caller bug and are not serialized
/// internally.
pub struct JobTracker {
    api: ComfyApi,
    config: ClientConfig,
    state: Arc<TrackerState>,
}

impl JobTracker {
    /// Create a tracker with no observer.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_observer(config, NoopObserver)
    }

    /// Create a tracker whose observer is invoked synchronously on
    /// every status transition, in frame arrival order.
    pub fn with_observer(config: ClientConfig, observer: impl StatusObserver + 'static) -> Self {
        let api = ComfyApi::new(config.api_url.clone());
        Self {
            api,
            config,
            state: Arc::new(TrackerState::new(Arc::new(observer))),
        }
    }

    /// The REST client for this server, for history/artifact calls
    /// after completion.
    pub fn api(&self) -> &ComfyApi {
        &self.api
    }

    /// Submit a workflow and start tracking it.
    ///
    /// Resets the status to `pending` with empty outputs, generates a
    /// client id (UUIDv4) when none is supplied, and performs one
    /// `POST /prompt` call. On success the event channel is opened on a
    /// background task and the server-issued prompt id is returned. On
    /// failure the status becomes `fail` with the response body
    /// attached, no channel is opened, and the error is returned.
    pub async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: Option<String>,
    ) -> Result<String, ComfyApiError> {
        let client_id = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.state.lock_store().reset();
        *self.state.lock_client_id() = Some(client_id.clone());

        // Fresh token per submission; the previous channel (if any) kept
        // a clone of the old one.
        let cancel = CancellationToken::new();
        *self.state.lock_cancel() = cancel.clone();

        match self.api.submit_workflow(workflow, &client_id).await {
            Ok(response) => {
                tracing::info!(
                    client_id = %client_id,
                    prompt_id = %response.prompt_id,
                    number = response.number,
                    "Workflow submitted",
                );
                tokio::spawn(channel::run_event_channel(
                    self.config.ws_url.clone(),
                    client_id,
                    Arc::clone(&self.state),
                    cancel,
                ));
                Ok(response.prompt_id)
            }
            Err(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "Workflow submission failed");
                let (detail, raw) = submission_failure_detail(&e);
                self.state.fail(detail, raw);
                Err(e)
            }
        }
    }

    /// Non-blocking snapshot of the current status.
    pub fn get_status(&self) -> JobStatus {
        self.state.lock_store().snapshot()
    }

    /// True once the job reached `completed`, `error`, `fail`, or
    /// `timed_out`.
    pub fn is_finished(&self) -> bool {
        self.state.lock_store().state().is_terminal()
    }

    /// Suspend until the status transitions (to any state, not just a
    /// terminal one) or `timeout` elapses.
    ///
    /// Returns immediately when the job is already in a terminal state.
    /// When the timeout fires with no terminal transition, the status
    /// is forced to `timed_out` and the event channel is closed. The
    /// timeout is a per-call liveness guard against a stalled stream,
    /// not a cumulative job deadline: callers with an overall deadline
    /// must track elapsed wall-clock time across repeated calls.
    ///
    /// Multiple tasks may wait concurrently; each woken waiter
    /// re-checks the store, so spurious wakeups are harmless.
    pub async fn wait_for_status(&self, timeout: Duration) -> JobStatus {
        let entry_version = {
            let store = self.state.lock_store();
            if store.state().is_terminal() {
                return store.snapshot();
            }
            store.version()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state.signal.notified();
            {
                let store = self.state.lock_store();
                if store.version() != entry_version || store.state().is_terminal() {
                    return store.snapshot();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Status wait timed out");
                return self.state.force_timeout();
            }
        }
    }

    /// Close the event channel without waiting for a terminal event
    /// (explicit external cancellation). Safe to call at any time, any
    /// number of times.
    pub fn close(&self) {
        self.state.close_channel();
    }
}

#[cfg(test)]
impl JobTracker {
    /// Direct access to the shared state for in-crate tests that feed
    /// frames without a live connection.
    pub(crate) fn state_for_tests(&self) -> &TrackerState {
        &self.state
    }

    /// Pin the session id so status broadcasts in tests count as ours.
    pub(crate) fn adopt_session_for_tests(&self, sid: &str) {
        *self.state.lock_client_id() = Some(sid.to_string());
    }
}

/// Pull a human-readable detail (and the parsed body, when it is JSON)
/// out of a submission failure.
fn submission_failure_detail(error: &ComfyApiError) -> (String, Option<serde_json::Value>) {
    match error {
        ComfyApiError::ApiError { body, .. } => {
            let raw = serde_json::from_str::<serde_json::Value>(body).ok();
            (body.clone(), raw)
        }
        ComfyApiError::Request(e) => (e.to_string(), None),
    }
}
