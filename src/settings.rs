use serde::{Deserialize, Serialize};

/// Top-level process configuration, loaded from `config.yaml` layered with
/// `APP_`-prefixed environment overrides (see `bin/rtmp_relay.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// RTMP listen address, e.g. "0.0.0.0:1935".
    #[serde(default = "default_listen_rtmp")]
    pub listen_rtmp: String,

    /// Path to the stream-definition persistence document.
    #[serde(default = "default_persistence_path")]
    pub persistence_path: String,
}

fn default_listen_rtmp() -> String {
    "0.0.0.0:1935".to_string()
}

fn default_persistence_path() -> String {
    "streams.json".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_rtmp: default_listen_rtmp(),
            persistence_path: default_persistence_path(),
        }
    }
}
