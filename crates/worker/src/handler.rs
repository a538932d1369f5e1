//! The job execution pipeline behind `POST /run`.
//!
//! A job runs end to end inside one handler call: validate the input,
//! wait for the ComfyUI API to come up, upload any input images,
//! submit the workflow, follow the event channel to a terminal state,
//! then collect the finished images from history and base64-encode
//! them into the result payload.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use comfykit_client::{ClientConfig, JobState, JobStatus, JobTracker};

use crate::callback::CallbackDelivery;
use crate::config::WorkerConfig;
use crate::input::{validate_input, JobInput};

/// Incoming job envelope: `{"id": "...", "input": {...}}`.
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    /// Caller-assigned job id; a fresh UUID is minted when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// The raw job input, validated by [`validate_input`].
    #[serde(default)]
    pub input: Option<Value>,
}

/// Run a job to completion and build its result payload.
///
/// Every failure mode maps to a JSON payload rather than an `Err`: the
/// caller of `/run` always gets a result body describing what
/// happened.
pub async fn run_job(config: &WorkerConfig, request: JobRequest) -> Value {
    let input = match validate_input(request.input.as_ref()) {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting invalid job input");
            return json!({"error": e.to_string()});
        }
    };

    let client_config = ClientConfig::from_host(&config.comfy_host);

    if !check_server(
        &client_config.api_url,
        config.startup_max_retries,
        config.startup_interval,
    )
    .await
    {
        return json!({
            "error": format!("ComfyUI API is not reachable at {}", client_config.api_url)
        });
    }

    // The job id doubles as the event-channel client id, so status
    // broadcasts from the server are addressed to this job.
    let job_id = request
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let tracker = JobTracker::new(client_config);

    if let Err(details) = upload_input_images(&tracker, &input).await {
        return json!({
            "status": "error",
            "message": "Some images failed to upload",
            "details": details,
        });
    }

    let prompt_id = match tracker.submit(&input.workflow, Some(job_id.clone())).await {
        Ok(prompt_id) => prompt_id,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Workflow submission failed");
            let status = tracker.get_status();
            return json!({"error": status.error.unwrap_or_else(|| e.to_string())});
        }
    };
    tracing::info!(job_id = %job_id, prompt_id = %prompt_id, "Workflow queued");

    let final_status = track_job(&tracker, config.job_timeout).await;

    let result = match final_status.state {
        JobState::Completed => {
            collect_outputs(&tracker, &prompt_id, config.refresh_worker).await
        }
        state => {
            tracing::error!(job_id = %job_id, ?state, "Job did not complete");
            if state == JobState::TimedOut {
                // The prompt may still be running server-side; stop it
                // so the next job does not queue behind a zombie.
                if let Err(e) = tracker.api().interrupt().await {
                    tracing::warn!(error = %e, "Interrupt request failed");
                }
            }
            json!({
                "status": state,
                "error": final_status
                    .error
                    .unwrap_or_else(|| "Job did not complete".to_string()),
                "detail": final_status.raw_event,
                "refresh_worker": config.refresh_worker,
            })
        }
    };

    if let Some(url) = &input.callback {
        deliver_callback(url, &result).await;
    }

    result
}

/// Probe the ComfyUI HTTP API until it answers or the retry budget
/// runs out.
pub async fn check_server(url: &str, retries: u32, delay: Duration) -> bool {
    let client = reqwest::Client::new();
    for attempt in 1..=retries {
        if let Ok(response) = client.get(url).send().await {
            if response.status().is_success() {
                tracing::info!(attempt, "ComfyUI API is reachable");
                return true;
            }
        }
        if attempt % 100 == 0 {
            tracing::info!(attempt, "Still waiting for the ComfyUI API");
        }
        tokio::time::sleep(delay).await;
    }
    tracing::error!(url, retries, "ComfyUI API never became reachable");
    false
}

/// Decode and upload the job's input images, collecting per-image
/// errors instead of stopping at the first one.
async fn upload_input_images(tracker: &JobTracker, input: &JobInput) -> Result<(), Vec<String>> {
    let mut upload_errors = Vec::new();

    for image in &input.images {
        let blob = match BASE64.decode(image.image.as_bytes()) {
            Ok(blob) => blob,
            Err(e) => {
                upload_errors.push(format!("Error decoding {}: {e}", image.name));
                continue;
            }
        };
        match tracker.api().upload_image(&image.name, blob).await {
            Ok(()) => tracing::debug!(name = %image.name, "Uploaded input image"),
            Err(e) => upload_errors.push(format!("Error uploading {}: {e}", image.name)),
        }
    }

    if upload_errors.is_empty() {
        Ok(())
    } else {
        Err(upload_errors)
    }
}

/// Drive the tracker's wait loop under a wall-clock deadline.
///
/// Each wait call gets whatever budget remains; once the deadline
/// passes, the zero-duration wait forces a `timed_out` terminal state.
async fn track_job(tracker: &JobTracker, budget: Duration) -> JobStatus {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = tracker.wait_for_status(remaining).await;
        if status.state.is_terminal() {
            return status;
        }
        tracing::debug!(state = ?status.state, "Job progressed");
    }
}

/// Fetch the history for a completed prompt and base64-encode its
/// output images into the success payload.
async fn collect_outputs(tracker: &JobTracker, prompt_id: &str, refresh_worker: bool) -> Value {
    let history = match tracker.api().get_history(prompt_id).await {
        Ok(history) => history,
        Err(e) => {
            tracing::error!(prompt_id, error = %e, "Failed to fetch history");
            return json!({
                "status": "error",
                "message": format!("Failed to fetch history: {e}"),
                "refresh_worker": refresh_worker,
            });
        }
    };

    let artifacts = comfykit_client::output_artifacts(&history, prompt_id);

    let mut images = Vec::new();
    for artifact in &artifacts {
        match tracker.api().fetch_artifact(artifact).await {
            Ok(bytes) => images.push(json!({
                "filename": artifact.filename,
                "subfolder": artifact.subfolder,
                "type": artifact.kind,
                "data": BASE64.encode(&bytes),
            })),
            Err(e) => {
                tracing::warn!(filename = %artifact.filename, error = %e, "Failed to fetch artifact");
            }
        }
    }

    if images.is_empty() {
        json!({
            "status": "success",
            "message": "No images saved.",
            "refresh_worker": refresh_worker,
        })
    } else {
        json!({
            "status": "success",
            "message": "Image generated successfully",
            "images": images,
            "refresh_worker": refresh_worker,
        })
    }
}

/// Push the result to the job's callback URL; failures are logged, not
/// fatal, since the result is also returned in the response body.
async fn deliver_callback(url: &str, result: &Value) {
    let delivery = match CallbackDelivery::new() {
        Ok(delivery) => delivery,
        Err(e) => {
            tracing::warn!(error = %e, "Could not build callback HTTP client");
            return;
        }
    };
    if let Err(e) = delivery.deliver(url, result).await {
        tracing::warn!(url, error = %e, "Callback delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::{Path, Query};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    const PROMPT_ID: &str = "prompt-worker-1";

    /// Bind the mock ComfyUI router on an ephemeral port, return `host:port`.
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("127.0.0.1:{}", addr.port())
    }

    async fn accept_prompt() -> Json<Value> {
        Json(json!({"prompt_id": PROMPT_ID, "number": 1}))
    }

    /// WS endpoint replaying a fixed frame script for the connecting client.
    fn ws_script(frames: fn(&str) -> Vec<Value>) -> axum::routing::MethodRouter {
        get(
            move |ws: WebSocketUpgrade, Query(params): Query<HashMap<String, String>>| async move {
                let client_id = params.get("clientId").cloned().unwrap_or_default();
                ws.on_upgrade(move |socket| send_frames(socket, frames(&client_id)))
            },
        )
    }

    async fn send_frames(mut socket: WebSocket, frames: Vec<Value>) {
        for frame in frames {
            if socket
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
        while socket.recv().await.is_some() {}
    }

    fn config_for(host: String, job_timeout: Duration) -> WorkerConfig {
        WorkerConfig {
            comfy_host: host,
            startup_max_retries: 20,
            startup_interval: Duration::from_millis(10),
            job_timeout,
            refresh_worker: false,
        }
    }

    fn request_with_workflow() -> JobRequest {
        serde_json::from_value(json!({
            "id": "job-42",
            "input": {"workflow": {"1": {"class_type": "KSampler", "inputs": {}}}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn run_job_returns_base64_images_on_completion() {
        async fn history(Path(prompt_id): Path<String>) -> Json<Value> {
            assert_eq!(prompt_id, PROMPT_ID);
            Json(json!({
                "prompt-worker-1": {
                    "outputs": {
                        "9": {
                            "images": [
                                {"filename": "out.png", "subfolder": "", "type": "output"}
                            ]
                        }
                    }
                }
            }))
        }
        async fn view() -> Vec<u8> {
            b"png-bytes".to_vec()
        }

        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/prompt", post(accept_prompt))
            .route(
                "/ws",
                ws_script(|_client_id| {
                    vec![
                        json!({"type": "executing", "data": {"node": "9", "prompt_id": PROMPT_ID}}),
                        json!({
                            "type": "executed",
                            "data": {
                                "node": "9",
                                "prompt_id": PROMPT_ID,
                                "output": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}
                            }
                        }),
                        json!({"type": "executing", "data": {"node": null, "prompt_id": PROMPT_ID}}),
                    ]
                }),
            )
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view));
        let host = serve(app).await;

        let config = config_for(host, Duration::from_secs(10));
        let result = run_job(&config, request_with_workflow()).await;

        assert_eq!(result["status"], "success");
        assert_eq!(result["message"], "Image generated successfully");
        assert_eq!(result["refresh_worker"], false);
        let images = result["images"].as_array().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0]["filename"], "out.png");
        assert_eq!(images[0]["type"], "output");
        assert_eq!(images[0]["data"], BASE64.encode(b"png-bytes"));
    }

    #[tokio::test]
    async fn run_job_maps_execution_error_to_an_error_payload() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/prompt", post(accept_prompt))
            .route(
                "/ws",
                ws_script(|_client_id| {
                    vec![json!({
                        "type": "execution_error",
                        "data": {
                            "prompt_id": PROMPT_ID,
                            "node_id": "5",
                            "exception_message": "CUDA out of memory",
                            "exception_type": "RuntimeError"
                        }
                    })]
                }),
            );
        let host = serve(app).await;

        let config = config_for(host, Duration::from_secs(10));
        let result = run_job(&config, request_with_workflow()).await;

        assert_eq!(result["status"], "error");
        assert_eq!(result["error"], "CUDA out of memory");
        assert_eq!(result["detail"]["type"], "execution_error");
        assert!(result.get("images").is_none());
    }

    #[tokio::test]
    async fn run_job_interrupts_the_server_when_the_deadline_passes() {
        let interrupted = Arc::new(AtomicBool::new(false));

        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/prompt", post(accept_prompt))
            .route(
                "/ws",
                // One progress frame, then the stream goes quiet.
                ws_script(|_client_id| {
                    vec![json!({"type": "progress", "data": {"value": 1, "max": 20}})]
                }),
            )
            .route(
                "/interrupt",
                post({
                    let interrupted = Arc::clone(&interrupted);
                    move || {
                        let interrupted = Arc::clone(&interrupted);
                        async move {
                            interrupted.store(true, Ordering::SeqCst);
                        }
                    }
                }),
            );
        let host = serve(app).await;

        let config = config_for(host, Duration::from_millis(200));
        let result = run_job(&config, request_with_workflow()).await;

        assert_eq!(result["status"], "timed_out");
        assert_eq!(result["error"], "Job did not complete");
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn job_request_tolerates_missing_fields() {
        let request: JobRequest = serde_json::from_str("{}").unwrap();
        assert!(request.id.is_none());
        assert!(request.input.is_none());
    }

    #[tokio::test]
    async fn check_server_succeeds_against_a_live_endpoint() {
        let app = axum::Router::new().route("/", axum::routing::get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        assert!(check_server(&format!("http://{addr}"), 5, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn check_server_gives_up_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(!check_server(&format!("http://{addr}"), 2, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn invalid_input_short_circuits_to_an_error_payload() {
        let config = WorkerConfig {
            comfy_host: "127.0.0.1:1".into(),
            startup_max_retries: 1,
            startup_interval: Duration::from_millis(1),
            job_timeout: Duration::from_secs(1),
            refresh_worker: false,
        };
        let request: JobRequest = serde_json::from_value(serde_json::json!({
            "id": "job-1",
            "input": {"images": []}
        }))
        .unwrap();

        let result = run_job(&config, request).await;
        assert_eq!(result["error"], "Missing 'workflow' parameter");
    }
}
