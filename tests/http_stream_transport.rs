//! Integration test for the HTTP streaming transport against a mocked
//! remote endpoint.

use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use transcript_relay_core::core::transport::http_stream::{HttpStreamConfig, HttpStreamTransport};
use transcript_relay_core::{SendOptions, Transport};

#[tokio::test]
async fn send_audio_parses_streamed_candidates_into_one_transcript() {
    let server = MockServer::start().await;

    let body = concat!(
        r#"{"candidates":[{"content":{"parts":[{"text":"hello "}]}}]}"#,
        "\n",
        r#"{"candidates":[{"content":{"parts":[{"text":"world"}]}}]}"#,
        "\n",
    );

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let config = HttpStreamConfig {
        stream_endpoint: format!(
            "{}/v1beta/models/gemini-2.0-flash:streamGenerateContent",
            server.uri()
        ),
        api_key: "test-key".into(),
        ..Default::default()
    };
    let (tx, mut rx) = mpsc::channel(8);
    let transport = HttpStreamTransport::new(config, tx).unwrap();
    transport.initialize().await.unwrap();

    let result = transport
        .send_audio(bytes::Bytes::from_static(&[0u8; 16]), SendOptions::default())
        .await
        .unwrap();

    let segment = result.segment.expect("http stream transport returns a segment synchronously");
    assert_eq!(segment.text, "hello world");

    let event = rx.recv().await.expect("transport emits a Transcription event too");
    match event {
        transcript_relay_core::TransportEvent::Transcription { segment, .. } => {
            assert_eq!(segment.text, "hello world");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn send_audio_surfaces_schema_error_on_4xx() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Invalid JSON payload"))
        .mount(&server)
        .await;

    let config = HttpStreamConfig {
        stream_endpoint: format!(
            "{}/v1beta/models/gemini-2.0-flash:streamGenerateContent",
            server.uri()
        ),
        api_key: "test-key".into(),
        ..Default::default()
    };
    let (tx, _rx) = mpsc::channel(8);
    let transport = HttpStreamTransport::new(config, tx).unwrap();
    transport.initialize().await.unwrap();

    let err = transport
        .send_audio(bytes::Bytes::from_static(&[0u8; 16]), SendOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), transcript_relay_core::RelayErrorKind::Schema);
}
