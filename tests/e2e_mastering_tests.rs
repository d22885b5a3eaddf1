//! End-to-end tests for the mastering lifecycle
//!
//! Uploads go through the real HTTP stack and scheduler; the engine and
//! converter are the in-process fakes, which tag the output with the tier
//! that produced it.

mod common;

use common::*;
use mastering_server::testing::{FakeConverter, FakeEngine};
use mastering_server::SchedulerConfig;
use reqwest::StatusCode;
use std::time::Duration;

#[tokio::test]
async fn test_parameter_mastering_produces_downloadable_wav() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let job_id = client
        .upload_track(
            TARGET_FILENAME,
            wav_bytes(),
            &[
                ("mastering_method", "parameter"),
                ("loudness", "-14"),
                ("bass_boost", "8"),
            ],
        )
        .await;

    let (status, _) = client.wait_for_terminal(&job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["method_requested"], "parameter");
    assert_eq!(status["method_used"], "parameter");
    assert_eq!(status["export_format"], "wav");
    assert_eq!(status["download_url"], format!("/download/{}", job_id));

    let response = client.download(&job_id).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "audio/wav");
    let disposition = response.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(MASTERED_WAV_FILENAME), "{}", disposition);

    let body = response.bytes().await.unwrap();
    assert!(body.starts_with(b"parameter:"));
    assert_eq!(body.len(), "parameter:".len() + TEST_WAV_SIZE_BYTES);
}

#[tokio::test]
async fn test_failing_parameter_tier_falls_back_to_reduced_settings() {
    let server = TestServer::spawn_with(TestServerOptions {
        engine: FakeEngine {
            fail_parameter: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let client = TestClient::new(server.base_url.clone());

    let job_id = client.upload_track(TARGET_FILENAME, wav_bytes(), &[]).await;
    let (status, _) = client.wait_for_terminal(&job_id).await;

    assert_eq!(status["status"], "completed");
    assert_eq!(status["method_used"], "reduced_parameter");
    let attempts = status["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["tier"], "parameter");
    assert_eq!(attempts[0]["succeeded"], false);
    assert_eq!(attempts[1]["tier"], "reduced_parameter");
    assert_eq!(attempts[1]["succeeded"], true);

    let body = client.download(&job_id).await.bytes().await.unwrap();
    assert!(body.starts_with(b"reduced_parameter:"));
}

#[tokio::test]
async fn test_passthrough_is_the_last_resort() {
    let server = TestServer::spawn_with(TestServerOptions {
        engine: FakeEngine {
            fail_parameter: true,
            fail_reduced: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let client = TestClient::new(server.base_url.clone());

    let job_id = client.upload_track(TARGET_FILENAME, wav_bytes(), &[]).await;
    let (status, _) = client.wait_for_terminal(&job_id).await;

    assert_eq!(status["status"], "completed");
    assert_eq!(status["method_used"], "passthrough");
    let body = client.download(&job_id).await.bytes().await.unwrap();
    assert_eq!(body.as_ref(), wav_bytes().as_slice());
}

#[tokio::test]
async fn test_reference_mastering_uses_the_reference_tier() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let response = client
        .upload(
            Some(UploadFile::new(TARGET_FILENAME, wav_bytes())),
            Some(UploadFile::new(REFERENCE_FILENAME, wav_bytes())),
            &[("mastering_method", "reference")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, _) = client.wait_for_terminal(&job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["method_requested"], "reference");
    assert_eq!(status["method_used"], "reference");

    let body = client.download(&job_id).await.bytes().await.unwrap();
    assert!(body.starts_with(b"reference:"));
}

#[tokio::test]
async fn test_corrupt_reference_falls_back_to_parameters() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let response = client
        .upload(
            Some(UploadFile::new(TARGET_FILENAME, wav_bytes())),
            Some(UploadFile::new(REFERENCE_FILENAME, corrupt_bytes())),
            &[("mastering_method", "reference")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, _) = client.wait_for_terminal(&job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["method_used"], "parameter");

    let attempts = status["attempts"].as_array().unwrap();
    assert_eq!(attempts[0]["tier"], "reference");
    assert_eq!(attempts[0]["succeeded"], false);
    assert!(attempts[0]["error"].as_str().unwrap().contains("corrupt"));
}

#[tokio::test]
async fn test_reference_without_matching_support_uses_parameters() {
    let server = TestServer::spawn_with(TestServerOptions {
        engine: FakeEngine {
            reference_matching: false,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let client = TestClient::new(server.base_url.clone());

    let response = client
        .upload(
            Some(UploadFile::new(TARGET_FILENAME, wav_bytes())),
            Some(UploadFile::new(REFERENCE_FILENAME, wav_bytes())),
            &[("mastering_method", "reference")],
        )
        .await;
    let body: serde_json::Value = response.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, _) = client.wait_for_terminal(&job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["method_used"], "parameter");
}

#[tokio::test]
async fn test_all_tiers_failing_fails_the_job() {
    let server = TestServer::spawn_with(TestServerOptions {
        engine: FakeEngine {
            fail_parameter: true,
            fail_reduced: true,
            ..Default::default()
        },
        converter: FakeConverter {
            fail_passthrough: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let client = TestClient::new(server.base_url.clone());

    let job_id = client.upload_track(TARGET_FILENAME, wav_bytes(), &[]).await;
    let (status, _) = client.wait_for_terminal(&job_id).await;

    assert_eq!(status["status"], "failed");
    assert!(status["method_used"].is_null());
    assert!(status["download_url"].is_null());
    let error = status["error"].as_str().unwrap();
    assert!(error.contains("all mastering methods failed"), "{}", error);
    assert_eq!(status["attempts"].as_array().unwrap().len(), 3);

    let response = client.download(&job_id).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!server
        .storage_root()
        .join("processed")
        .join(format!("{}.wav", job_id))
        .exists());
}

#[tokio::test]
async fn test_mp3_export() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let job_id = client
        .upload_track(TARGET_FILENAME, wav_bytes(), &[("export_format", "mp3")])
        .await;
    let (status, _) = client.wait_for_terminal(&job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["export_format"], "mp3");

    let response = client.download(&job_id).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "audio/mpeg");
    let disposition = response.headers()["content-disposition"].to_str().unwrap();
    assert!(disposition.contains("mastered_song.mp3"), "{}", disposition);
}

#[tokio::test]
async fn test_export_failure_fails_every_tier() {
    let server = TestServer::spawn_with(TestServerOptions {
        converter: FakeConverter {
            fail_encode: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let client = TestClient::new(server.base_url.clone());

    let job_id = client
        .upload_track(TARGET_FILENAME, wav_bytes(), &[("export_format", "mp3")])
        .await;
    let (status, _) = client.wait_for_terminal(&job_id).await;
    assert_eq!(status["status"], "failed");
}

#[tokio::test]
async fn test_stuck_engine_times_out() {
    let server = TestServer::spawn_with(TestServerOptions {
        engine: FakeEngine {
            hang: true,
            ..Default::default()
        },
        scheduler: SchedulerConfig {
            worker_concurrency: 1,
            processing_timeout: Duration::from_millis(300),
            strict_transitions: true,
        },
        ..Default::default()
    })
    .await;
    let client = TestClient::new(server.base_url.clone());

    let job_id = client.upload_track(TARGET_FILENAME, wav_bytes(), &[]).await;
    let (status, _) = client.wait_for_terminal(&job_id).await;

    assert_eq!(status["status"], "failed");
    assert!(status["error"].as_str().unwrap().contains("timed out"));
    assert_eq!(server.engine.call_count(), 1);
}

#[tokio::test]
async fn test_concurrent_uploads_all_complete() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let mut job_ids = Vec::new();
    for _ in 0..5 {
        job_ids.push(client.upload_track(TARGET_FILENAME, wav_bytes(), &[]).await);
    }

    for job_id in &job_ids {
        let (status, _) = client.wait_for_terminal(job_id).await;
        assert_eq!(status["status"], "completed");
    }
    assert!(server.scheduler.active_workers() <= 2);
}
