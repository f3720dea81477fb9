use std::str::FromStr;
use std::time::Duration;

use genjob_comfyui::monitor::MonitorSettings;
use genjob_comfyui::readiness::{BackoffConfig, ProbePolicy};
use genjob_comfyui::reconnect::ReconnectConfig;

/// Default log filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "genjob_worker=info,genjob_comfyui=info";

/// Extra directives enabled by `WEBSOCKET_TRACE`.
const WEBSOCKET_TRACE_FILTER: &str = "tokio_tungstenite=trace,tungstenite=trace";

/// Worker configuration loaded from environment variables.
///
/// Built once at startup and passed by reference to every job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// `host:port` of the ComfyUI server.
    pub comfy_host: String,
    /// How to wait for the server before each job.
    pub probe: ProbePolicy,
    /// Read timeout and reconnection bounds for the WebSocket.
    pub monitor: MonitorSettings,
    /// Enable trace logging of WebSocket frames.
    pub websocket_trace: bool,
    /// Ask the dispatch host to recycle the worker after each job.
    pub refresh_worker: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            comfy_host: "127.0.0.1:8188".into(),
            probe: ProbePolicy::default(),
            monitor: MonitorSettings::default(),
            websocket_trace: false,
            refresh_worker: false,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                           | Default          |
    /// |-----------------------------------|------------------|
    /// | `COMFY_HOST`                      | `127.0.0.1:8188` |
    /// | `COMFY_API_AVAILABLE_INTERVAL_MS` | `50`             |
    /// | `COMFY_API_AVAILABLE_MAX_RETRIES` | `500`            |
    /// | `COMFY_API_BACKOFF_PROBE`         | `false`          |
    /// | `WEBSOCKET_RECONNECT_ATTEMPTS`    | `5`              |
    /// | `WEBSOCKET_RECONNECT_DELAY_S`     | `3`              |
    /// | `WEBSOCKET_RECEIVE_TIMEOUT_S`     | `10`             |
    /// | `WEBSOCKET_TRACE`                 | `false`          |
    /// | `REFRESH_WORKER`                  | `false`          |
    ///
    /// Unparseable numbers fall back to the default with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`WorkerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let comfy_host = lookup("COMFY_HOST")
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "127.0.0.1:8188".into());

        let probe = if flag(&lookup, "COMFY_API_BACKOFF_PROBE") {
            ProbePolicy::Backoff(BackoffConfig::default())
        } else {
            ProbePolicy::Fixed {
                max_attempts: number(&lookup, "COMFY_API_AVAILABLE_MAX_RETRIES", 500),
                interval: Duration::from_millis(number(
                    &lookup,
                    "COMFY_API_AVAILABLE_INTERVAL_MS",
                    50,
                )),
            }
        };

        let monitor = MonitorSettings {
            receive_timeout: Duration::from_secs(number(&lookup, "WEBSOCKET_RECEIVE_TIMEOUT_S", 10)),
            reconnect: ReconnectConfig {
                max_attempts: number(&lookup, "WEBSOCKET_RECONNECT_ATTEMPTS", 5),
                delay: Duration::from_secs(number(&lookup, "WEBSOCKET_RECONNECT_DELAY_S", 3)),
            },
        };

        Self {
            comfy_host,
            probe,
            monitor,
            websocket_trace: flag(&lookup, "WEBSOCKET_TRACE"),
            refresh_worker: flag(&lookup, "REFRESH_WORKER"),
        }
    }

    /// Log filter directives used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> String {
        if self.websocket_trace {
            format!("{DEFAULT_LOG_FILTER},{WEBSOCKET_TRACE_FILTER}")
        } else {
            DEFAULT_LOG_FILTER.to_string()
        }
    }
}

/// `true` only for a case-insensitive `"true"`.
fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "Invalid value, using default");
            default
        }
    }
}
