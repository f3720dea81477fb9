#![allow(dead_code)]

use std::time::Duration;

use genjob_comfyui::api::ComfyUIApi;
use genjob_comfyui::client::ComfyUIClient;
use genjob_comfyui::monitor::MonitorSettings;
use genjob_comfyui::reconnect::ReconnectConfig;
use genjob_test_utils::FakeEngine;

/// Start a fake engine and build clients pointed at it.
pub async fn engine() -> (FakeEngine, ComfyUIClient, ComfyUIApi) {
    let engine = FakeEngine::start().await.unwrap();
    let client = ComfyUIClient::from_host(&engine.host());
    let api = ComfyUIApi::new(client.api_url().to_string());
    (engine, client, api)
}

/// Monitor settings with short timeouts so failure paths finish quickly.
pub fn fast_settings(max_attempts: u32) -> MonitorSettings {
    MonitorSettings {
        receive_timeout: Duration::from_millis(100),
        reconnect: ReconnectConfig {
            max_attempts,
            delay: Duration::from_millis(10),
        },
    }
}

/// A minimal API-format workflow. Its content is never inspected.
pub fn workflow() -> serde_json::Value {
    serde_json::json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 1}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0]}}
    })
}
