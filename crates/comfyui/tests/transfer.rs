//! Integration tests for image upload, history and artifact collection.

mod common;

use std::time::Duration;

use base64::Engine as _;
use genjob_comfyui::collector::collect_artifacts;
use genjob_comfyui::history::extract_manifest;
use genjob_comfyui::readiness::{wait_until_ready, ProbePolicy};
use genjob_comfyui::upload::upload_images;
use genjob_core::job::ImagePayload;
use serde_json::json;

fn payload(name: &str, image: &str) -> ImagePayload {
    ImagePayload {
        name: name.to_string(),
        image: image.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Test: readiness probe waits for a 200
// ---------------------------------------------------------------------------

#[tokio::test]
async fn readiness_succeeds_on_first_ok() {
    let (engine, _client, api) = common::engine().await;

    let attempts = wait_until_ready(&api, &ProbePolicy::default()).await.unwrap();

    assert_eq!(attempts, 1);
    assert_eq!(engine.root_hits(), 1);
}

#[tokio::test]
async fn readiness_gives_up_on_persistent_errors() {
    let (engine, _client, api) = common::engine().await;
    engine.set_root_status(500);
    let policy = ProbePolicy::Fixed {
        max_attempts: 4,
        interval: Duration::from_millis(5),
    };

    assert!(wait_until_ready(&api, &policy).await.is_err());
    assert_eq!(engine.root_hits(), 4);
}

// ---------------------------------------------------------------------------
// Test: uploads strip Data-URI prefixes and set overwrite
// ---------------------------------------------------------------------------

#[tokio::test]
async fn uploads_decode_and_overwrite() {
    let (engine, _client, api) = common::engine().await;

    let report = upload_images(
        &api,
        &[
            payload("a.png", "data:image/png;base64,AAA="),
            payload("b.png", "AQID"),
        ],
    )
    .await;

    assert!(report.is_success());
    assert_eq!(report.uploaded, ["a.png", "b.png"]);

    let uploads = engine.uploads();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].filename, "a.png");
    assert_eq!(uploads[0].overwrite.as_deref(), Some("true"));
    assert_eq!(uploads[0].size, 2);
    assert_eq!(uploads[1].size, 3);
}

#[tokio::test]
async fn upload_failures_are_aggregated() {
    let (engine, _client, api) = common::engine().await;
    engine.fail_upload("b.png");

    let report = upload_images(
        &api,
        &[
            payload("a.png", "AAA="),
            payload("b.png", "AAA="),
            payload("c.png", "%%%"),
            payload("d.png", "AAA="),
        ],
    )
    .await;

    assert!(!report.is_success());
    assert_eq!(report.uploaded, ["a.png", "d.png"]);
    assert_eq!(report.failures.len(), 2);
    assert!(report.failures[0].starts_with("Error uploading b.png"));
    assert!(report.failures[1].starts_with("Error decoding base64 for c.png"));
}

// ---------------------------------------------------------------------------
// Test: history lookup distinguishes unknown prompts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_for_unknown_prompt_is_not_found() {
    let (_engine, _client, api) = common::engine().await;

    let history = api.get_history("missing").await.unwrap();

    assert!(extract_manifest(&history, "missing").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Test: temp images are filtered and fetched bytes are base64-encoded
// ---------------------------------------------------------------------------

#[tokio::test]
async fn collects_only_persistent_images() {
    let (engine, _client, api) = common::engine().await;
    engine.set_history(
        "p1",
        json!({"outputs": {
            "9": {"images": [
                {"filename": "final.png", "subfolder": "runs", "type": "output"},
                {"filename": "preview.png", "subfolder": "", "type": "temp"}
            ]},
            "11": {"images": [{"filename": "gone.png", "subfolder": "", "type": "output"}]}
        }}),
    );
    engine.add_image("final.png", vec![1, 2, 3]);
    engine.add_image("preview.png", vec![9, 9, 9]);

    let history = api.get_history("p1").await.unwrap();
    let manifest = extract_manifest(&history, "p1").unwrap().unwrap();
    let collection = collect_artifacts(&api, &manifest).await;

    assert_eq!(collection.artifacts.len(), 1);
    let artifact = &collection.artifacts[0];
    assert_eq!(artifact.filename, "final.png");
    assert_eq!(artifact.encoding, "base64");
    assert_eq!(
        base64::engine::general_purpose::STANDARD
            .decode(&artifact.data)
            .unwrap(),
        vec![1u8, 2, 3]
    );
    assert_eq!(
        collection.errors,
        ["Failed to fetch image data for gone.png from /view endpoint."]
    );

    // The temp preview is never requested; the lookup key is passed through.
    let views = engine.views();
    assert!(views.iter().all(|v| v.filename != "preview.png"));
    let final_view = views.iter().find(|v| v.filename == "final.png").unwrap();
    assert_eq!(final_view.subfolder, "runs");
    assert_eq!(final_view.kind, "output");
}
