//! Event dispatcher: classifies inbound frames into status transitions.
//!
//! Called by the event-channel task for every text frame, in arrival
//! order. Each recognized frame maps to exactly one transition on the
//! shared [`TrackerState`]; malformed or unknown frames are dropped
//! without touching the job status.
//!
//! Completion is signaled on two independent paths: an `executing`
//! frame with a null node, and a `status` broadcast addressed to our
//! session with an empty queue. Whichever arrives first wins the
//! `completed` transition; the channel close behind it is idempotent,
//! so the loser is a no-op.

use crate::messages::{parse_message, ComfyMessage};
use crate::tracker::TrackerState;

/// Parse and dispatch a single inbound text frame.
pub(crate) fn handle_text_frame(state: &TrackerState, text: &str) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed event frame");
            return;
        }
    };
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Unknown "type" values are routine (extension nodes
            // broadcast their own frames).
            tracing::debug!(error = %e, "Ignoring unrecognized event frame");
            return;
        }
    };
    apply_message(state, msg, raw);
}

/// Apply one parsed frame to the tracker state.
pub(crate) fn apply_message(state: &TrackerState, msg: ComfyMessage, raw: serde_json::Value) {
    match msg {
        // A null node means the prompt finished executing; the embedded
        // queue status (when present) says whether more work is queued.
        ComfyMessage::Executing(data) if data.node.is_none() => {
            let queue_remaining = data
                .status
                .as_ref()
                .map(|s| s.exec_info.queue_remaining)
                .unwrap_or(0);
            finish_or_queue(state, queue_remaining, raw);
        }

        ComfyMessage::Status(data) => {
            if state.is_own_session(data.sid.as_deref()) {
                finish_or_queue(state, data.status.exec_info.queue_remaining, raw);
            } else {
                tracing::trace!(sid = ?data.sid, "Ignoring status broadcast for another session");
            }
        }

        ComfyMessage::Executed(data) => {
            state.record_output(data.output, raw);
        }

        ComfyMessage::ExecutionSuccess(data) => {
            tracing::info!(prompt_id = ?data.prompt_id, "Execution succeeded");
            state.complete(raw);
        }

        ComfyMessage::ExecutionError(data) => {
            let detail = data
                .exception_message
                .clone()
                .unwrap_or_else(|| raw.to_string());
            tracing::error!(
                prompt_id = ?data.prompt_id,
                node_id = ?data.node_id,
                error_type = ?data.exception_type,
                error_message = %detail,
                "Execution error",
            );
            state.server_error(detail, raw);
        }

        ComfyMessage::Error(payload) => {
            tracing::error!(payload = %payload, "Server error frame");
            state.server_error(payload.to_string(), raw);
        }

        // A node is executing, or step/caching progress arrived.
        ComfyMessage::Executing(_)
        | ComfyMessage::Progress(_)
        | ComfyMessage::ExecutionStart(_)
        | ComfyMessage::ExecutionCached(_) => {
            state.progress(raw);
        }
    }
}

/// Queued while other prompts remain ahead of us; completed once the
/// queue drains.
fn finish_or_queue(state: &TrackerState, queue_remaining: i32, raw: serde_json::Value) {
    if queue_remaining > 0 {
        state.queue(raw);
    } else {
        state.complete(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::observer::StatusObserver;
    use crate::status::{JobState, JobStatus};
    use crate::tracker::JobTracker;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Observer that records every snapshot it is handed.
    struct Recorder {
        snapshots: Mutex<Vec<JobStatus>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(Vec::new()),
            })
        }
        fn states(&self) -> Vec<JobState> {
            self.snapshots.lock().unwrap().iter().map(|s| s.state).collect()
        }
        fn last(&self) -> JobStatus {
            self.snapshots.lock().unwrap().last().cloned().expect("no snapshots")
        }
        fn count(&self) -> usize {
            self.snapshots.lock().unwrap().len()
        }
    }

    impl StatusObserver for Arc<Recorder> {
        fn on_status_changed(&self, status: &JobStatus) {
            self.snapshots.lock().unwrap().push(status.clone());
        }
    }

    fn tracker_with_recorder(sid: &str) -> (JobTracker, Arc<Recorder>) {
        let recorder = Recorder::new();
        let tracker = JobTracker::with_observer(
            ClientConfig::from_host("127.0.0.1:8188"),
            Arc::clone(&recorder),
        );
        tracker.adopt_session_for_tests(sid);
        (tracker, recorder)
    }

    fn feed(tracker: &JobTracker, frame: serde_json::Value) {
        handle_text_frame(tracker.state_for_tests(), &frame.to_string());
    }

    fn status_frame(sid: &str, queue_remaining: i32) -> serde_json::Value {
        json!({
            "type": "status",
            "data": {"sid": sid, "status": {"exec_info": {"queue_remaining": queue_remaining}}}
        })
    }

    fn executed_frame(output: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "executed",
            "data": {"node": "9", "prompt_id": "p-1", "output": output}
        })
    }

    fn finished_executing_frame() -> serde_json::Value {
        json!({"type": "executing", "data": {"node": null, "prompt_id": "p-1"}})
    }

    #[test]
    fn queue_then_drain_reaches_completed() {
        let (t, recorder) = tracker_with_recorder("me");
        feed(&t, status_frame("me", 1));
        feed(&t, status_frame("me", 0));
        assert_eq!(recorder.states(), vec![JobState::Queued, JobState::Completed]);
        assert!(t.is_finished());
    }

    #[test]
    fn executed_then_null_node_collects_one_output() {
        let (t, _) = tracker_with_recorder("me");
        feed(&t, executed_frame(json!({"images": [{"filename": "out.png"}]})));
        feed(&t, finished_executing_frame());

        let status = t.get_status();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.outputs.len(), 1);
        assert_eq!(status.outputs[0]["images"][0]["filename"], "out.png");
    }

    #[test]
    fn null_node_with_queue_remaining_means_queued() {
        let (t, _) = tracker_with_recorder("me");
        feed(
            &t,
            json!({
                "type": "executing",
                "data": {
                    "node": null,
                    "prompt_id": "p-1",
                    "status": {"exec_info": {"queue_remaining": 2}}
                }
            }),
        );
        assert_eq!(t.get_status().state, JobState::Queued);
        assert!(!t.is_finished());
    }

    #[test]
    fn executing_a_node_is_processing() {
        let (t, _) = tracker_with_recorder("me");
        feed(
            &t,
            json!({"type": "executing", "data": {"node": "42", "prompt_id": "p-1"}}),
        );
        assert_eq!(t.get_status().state, JobState::Processing);
    }

    #[test]
    fn progress_and_start_frames_are_processing() {
        let (t, recorder) = tracker_with_recorder("me");
        feed(&t, json!({"type": "execution_start", "data": {"prompt_id": "p-1"}}));
        feed(&t, json!({"type": "progress", "data": {"value": 5, "max": 20}}));
        assert_eq!(
            recorder.states(),
            vec![JobState::Processing, JobState::Processing]
        );
    }

    #[test]
    fn execution_success_completes() {
        let (t, _) = tracker_with_recorder("me");
        feed(&t, json!({"type": "execution_success", "data": {"prompt_id": "p-1"}}));
        assert_eq!(t.get_status().state, JobState::Completed);
    }

    #[test]
    fn error_frame_is_terminal_and_absorbs_later_frames() {
        let (t, recorder) = tracker_with_recorder("me");
        feed(&t, json!({"type": "progress", "data": {"value": 1, "max": 20}}));
        feed(
            &t,
            json!({
                "type": "execution_error",
                "data": {
                    "prompt_id": "p-1",
                    "node_id": "5",
                    "exception_message": "out of memory",
                    "exception_type": "RuntimeError"
                }
            }),
        );
        // Frames racing in after the terminal transition change nothing.
        feed(&t, executed_frame(json!({"images": []})));
        feed(&t, status_frame("me", 0));

        let status = t.get_status();
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.error.as_deref(), Some("out of memory"));
        assert!(status.outputs.is_empty());
        assert_eq!(recorder.states(), vec![JobState::Processing, JobState::Error]);
    }

    #[test]
    fn bare_error_frame_attaches_payload_verbatim() {
        let (t, _) = tracker_with_recorder("me");
        feed(&t, json!({"type": "error", "data": {"message": "bad node"}}));
        let status = t.get_status();
        assert_eq!(status.state, JobState::Error);
        assert!(status.error.as_deref().unwrap().contains("bad node"));
    }

    #[test]
    fn foreign_session_status_broadcast_is_ignored() {
        let (t, recorder) = tracker_with_recorder("me");
        feed(&t, status_frame("someone-else", 0));
        assert_eq!(t.get_status().state, JobState::Pending);
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn unknown_and_malformed_frames_are_dropped() {
        let (t, recorder) = tracker_with_recorder("me");
        feed(&t, json!({"type": "crystools.monitor", "data": {"gpus": []}}));
        handle_text_frame(t.state_for_tests(), "{not json");
        assert_eq!(t.get_status().state, JobState::Pending);
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn observer_fires_once_per_processed_frame_in_order() {
        let (t, recorder) = tracker_with_recorder("me");
        feed(&t, status_frame("me", 2));
        feed(&t, json!({"type": "executing", "data": {"node": "3", "prompt_id": "p-1"}}));
        feed(&t, executed_frame(json!({"images": []})));
        feed(&t, finished_executing_frame());

        assert_eq!(
            recorder.states(),
            vec![
                JobState::Queued,
                JobState::Processing,
                JobState::Processing,
                JobState::Completed,
            ]
        );
        assert_eq!(recorder.last().state, JobState::Completed);
    }

    #[test]
    fn first_completion_path_wins_the_tie() {
        let (t, recorder) = tracker_with_recorder("me");
        feed(&t, finished_executing_frame());
        // Same-tick status broadcast claiming completion as well.
        feed(&t, status_frame("me", 0));

        assert_eq!(recorder.states(), vec![JobState::Completed]);
        let raw = t.get_status().raw_event.expect("raw event recorded");
        assert_eq!(raw["type"], "executing");
    }

    #[test]
    fn outputs_accumulate_in_arrival_order() {
        let (t, _) = tracker_with_recorder("me");
        feed(&t, executed_frame(json!({"images": [{"filename": "a.png"}]})));
        feed(&t, executed_frame(json!({"images": [{"filename": "b.png"}]})));
        feed(&t, finished_executing_frame());

        let status = t.get_status();
        assert_eq!(status.outputs.len(), 2);
        assert_eq!(status.outputs[0]["images"][0]["filename"], "a.png");
        assert_eq!(status.outputs[1]["images"][0]["filename"], "b.png");
    }
}
