//! Client configuration.

/// Connection configuration for one ComfyUI server, passed explicitly
/// to [`JobTracker`](crate::tracker::JobTracker) at construction time.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL, e.g. `http://host:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://host:8188`.
    pub ws_url: String,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: ws_url.into(),
        }
    }

    /// Build both URLs from a bare `host:port` address.
    pub fn from_host(host: &str) -> Self {
        Self {
            api_url: format!("http://{host}"),
            ws_url: format!("ws://{host}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_host_derives_both_urls() {
        let config = ClientConfig::from_host("127.0.0.1:8188");
        assert_eq!(config.api_url, "http://127.0.0.1:8188");
        assert_eq!(config.ws_url, "ws://127.0.0.1:8188");
    }
}
