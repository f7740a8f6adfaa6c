//! End-to-end integration test driving [`FallbackManager`] over real
//! HTTP-backed transports against mocked remote endpoints.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use transcript_relay_core::core::transport::batch::{BatchConfig, BatchTransport};
use transcript_relay_core::core::transport::http_stream::{HttpStreamConfig, HttpStreamTransport};
use transcript_relay_core::{
    BufferConfig, CircuitBreakerConfig, FallbackConfig, FallbackManager, MonitorConfig,
    ReconcilerConfig, ReplayConfig, SendOptions, Transport, TransportId,
};

async fn healthy_http_stream(server: &MockServer, events: mpsc::Sender<transcript_relay_core::TransportEvent>) -> HttpStreamTransport {
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#, "\n"),
            "application/json",
        ))
        .mount(server)
        .await;

    let config = HttpStreamConfig {
        stream_endpoint: format!(
            "{}/v1beta/models/gemini-2.0-flash:streamGenerateContent",
            server.uri()
        ),
        api_key: "test-key".into(),
        ..Default::default()
    };
    HttpStreamTransport::new(config, events).unwrap()
}

#[tokio::test]
async fn falls_back_from_failing_http_stream_to_batch() {
    let http_server = MockServer::start().await;
    let batch_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Invalid JSON payload"))
        .mount(&http_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "batch result"}]}}]
        })))
        .mount(&batch_server)
        .await;

    let (http_events_tx, _http_events_rx) = mpsc::channel(16);
    let http_stream = HttpStreamTransport::new(
        HttpStreamConfig {
            stream_endpoint: format!(
                "{}/v1beta/models/gemini-2.0-flash:streamGenerateContent",
                http_server.uri()
            ),
            api_key: "test-key".into(),
            ..Default::default()
        },
        http_events_tx,
    )
    .unwrap();

    let (batch_events_tx, _batch_events_rx) = mpsc::channel(16);
    let batch = BatchTransport::new(
        BatchConfig {
            endpoint: format!("{}/v1beta/models/gemini-2.0-flash:generateContent", batch_server.uri()),
            api_key: "test-key".into(),
            max_batch_bytes: 4,
            max_delay: Duration::from_secs(30),
            ..Default::default()
        },
        batch_events_tx,
    )
    .unwrap();

    let transports: Vec<Arc<dyn Transport>> = vec![Arc::new(http_stream), Arc::new(batch)];

    let (manager, mut relay_events, _monitor_rx) = FallbackManager::with_circuit_breaker_config(
        FallbackConfig { max_consecutive_1007: 1, max_schema_variant_failures: 1, ..Default::default() },
        transports,
        BufferConfig::default(),
        ReplayConfig::default(),
        ReconcilerConfig::default(),
        MonitorConfig::default(),
        CircuitBreakerConfig::default(),
    );

    manager.start(Some("session-1".into())).await.unwrap();
    assert_eq!(manager.get_statistics().current_transport, Some(TransportId::HttpStream));

    let err = manager
        .send_audio(
            Bytes::from_static(&[0u8; 16]),
            SendOptions { session_id: Some("session-1".into()), ..Default::default() },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), transcript_relay_core::RelayErrorKind::Schema);

    // The schema error should have already pushed the manager past its
    // threshold (1) and triggered a fallback to the batch tier.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.get_statistics().current_transport, Some(TransportId::Batch));

    let mut saw_transport_changed = false;
    while let Ok(event) = relay_events.try_recv() {
        if let transcript_relay_core::RelayEvent::TransportChanged { to: TransportId::Batch, .. } = event {
            saw_transport_changed = true;
        }
    }
    assert!(saw_transport_changed, "expected a TransportChanged event into the batch tier");

    manager.destroy().await;
}

#[tokio::test]
async fn healthy_http_stream_serves_without_falling_back() {
    let server = MockServer::start().await;
    let (events_tx, _events_rx) = mpsc::channel(16);
    let http_stream = healthy_http_stream(&server, events_tx).await;

    let transports: Vec<Arc<dyn Transport>> = vec![Arc::new(http_stream)];
    let (manager, _sub, _monitor_rx) = FallbackManager::new(
        FallbackConfig::default(),
        transports,
        BufferConfig::default(),
        ReplayConfig::default(),
        ReconcilerConfig::default(),
        MonitorConfig::default(),
    );

    manager.start(None).await.unwrap();
    manager.send_audio(Bytes::from_static(&[1u8; 8]), SendOptions::default()).await.unwrap();
    assert_eq!(manager.get_statistics().current_transport, Some(TransportId::HttpStream));
    manager.destroy().await;
}
