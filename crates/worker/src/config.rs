use std::time::Duration;

/// Worker configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for a ComfyUI instance
/// running alongside the worker. In production, override via
/// environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `host:port` of the ComfyUI server (default: `127.0.0.1:8188`).
    pub comfy_host: String,
    /// Attempts when probing the ComfyUI API at job start.
    pub startup_max_retries: u32,
    /// Delay between availability probes.
    pub startup_interval: Duration,
    /// Wall-clock budget for a single job, submission to terminal state.
    pub job_timeout: Duration,
    /// Ask the platform to recycle this worker after every job.
    pub refresh_worker: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                           | Default          |
    /// |-----------------------------------|------------------|
    /// | `COMFY_HOST`                      | `127.0.0.1:8188` |
    /// | `COMFY_API_AVAILABLE_MAX_RETRIES` | `500`            |
    /// | `COMFY_API_AVAILABLE_INTERVAL_MS` | `50`             |
    /// | `COMFY_JOB_TIMEOUT_SECS`          | `600`            |
    /// | `REFRESH_WORKER`                  | `false`          |
    pub fn from_env() -> Self {
        let comfy_host =
            std::env::var("COMFY_HOST").unwrap_or_else(|_| "127.0.0.1:8188".into());

        let startup_max_retries: u32 = std::env::var("COMFY_API_AVAILABLE_MAX_RETRIES")
            .unwrap_or_else(|_| "500".into())
            .parse()
            .expect("COMFY_API_AVAILABLE_MAX_RETRIES must be a valid u32");

        let startup_interval_ms: u64 = std::env::var("COMFY_API_AVAILABLE_INTERVAL_MS")
            .unwrap_or_else(|_| "50".into())
            .parse()
            .expect("COMFY_API_AVAILABLE_INTERVAL_MS must be a valid u64");

        let job_timeout_secs: u64 = std::env::var("COMFY_JOB_TIMEOUT_SECS")
            .unwrap_or_else(|_| "600".into())
            .parse()
            .expect("COMFY_JOB_TIMEOUT_SECS must be a valid u64");

        let refresh_worker = std::env::var("REFRESH_WORKER")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            comfy_host,
            startup_max_retries,
            startup_interval: Duration::from_millis(startup_interval_ms),
            job_timeout: Duration::from_secs(job_timeout_secs),
            refresh_worker,
        }
    }
}
