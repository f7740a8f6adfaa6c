//! Integration test for the batch transport against a mocked remote endpoint.

use std::time::Duration;

use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use transcript_relay_core::core::transport::batch::{BatchConfig, BatchTransport};
use transcript_relay_core::{SendOptions, Transport};

#[tokio::test]
async fn byte_threshold_triggers_immediate_flush() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "batched result"}]}}]
        })))
        .mount(&server)
        .await;

    let config = BatchConfig {
        endpoint: format!("{}/v1beta/models/gemini-2.0-flash:generateContent", server.uri()),
        api_key: "test-key".into(),
        max_batch_bytes: 8,
        max_delay: Duration::from_secs(30),
        ..Default::default()
    };
    let (tx, _rx) = mpsc::channel(8);
    let transport = BatchTransport::new(config, tx).unwrap();
    transport.initialize().await.unwrap();

    let result = transport
        .send_audio(bytes::Bytes::from_static(&[0u8; 16]), SendOptions::default())
        .await
        .unwrap();

    let segment = result.segment.expect("crossing the byte threshold flushes synchronously");
    assert_eq!(segment.text, "batched result");
}

#[tokio::test]
async fn below_threshold_chunk_is_buffered_until_turn_complete() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "final flush"}]}}]
        })))
        .mount(&server)
        .await;

    let config = BatchConfig {
        endpoint: format!("{}/v1beta/models/gemini-2.0-flash:generateContent", server.uri()),
        api_key: "test-key".into(),
        max_batch_bytes: 1024,
        max_delay: Duration::from_secs(30),
        ..Default::default()
    };
    let (tx, _rx) = mpsc::channel(8);
    let transport = BatchTransport::new(config, tx).unwrap();
    transport.initialize().await.unwrap();

    let buffered = transport
        .send_audio(bytes::Bytes::from_static(&[0u8; 4]), SendOptions::default())
        .await
        .unwrap();
    assert!(buffered.segment.is_none(), "chunk below threshold should not flush yet");

    transport.send_turn_complete().await.unwrap();
}
