//! Public entry point: assembles the three transport tiers and the
//! [`FallbackManager`] from a single [`RelayConfig`], wiring each
//! transport's and the monitor's event channel into the manager's reaction
//! handlers as background tasks.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::config::RelayConfig;
use crate::core::transport::batch::BatchTransport;
use crate::core::transport::http_stream::HttpStreamTransport;
use crate::core::transport::socket::SocketTransport;
use crate::core::{FallbackManager, FallbackStatistics, RelayEvent, SendOptions, Transport};
use crate::errors::RelayResult;

/// Owns a [`FallbackManager`] and the background tasks that feed it
/// transport and monitor events. This is the crate's intended construction
/// path; callers who need a custom transport set can still build a
/// [`FallbackManager`] directly.
pub struct TranscriptRelay {
    manager: Arc<FallbackManager>,
}

impl TranscriptRelay {
    /// Builds all three transport tiers from `config`, wires them into a
    /// [`FallbackManager`], and spawns the forwarding tasks that drain the
    /// transports' and monitor's event channels into it. The returned
    /// receiver carries consumer-facing [`RelayEvent`]s; call
    /// [`TranscriptRelay::start`] once a subscriber is attached.
    pub fn new(config: RelayConfig) -> RelayResult<(Self, broadcast::Receiver<RelayEvent>)> {
        let fallback_config = config.fallback;
        let buffer_config = config.buffer;
        let replay_config = config.replay;
        let reconciler_config = config.reconciler;
        let monitor_config = config.monitor;
        let circuit_breaker_config = config.circuit_breaker;
        let (socket_config, http_stream_config, batch_config) = config.into_transport_configs();

        let (transport_events_tx, mut transport_events_rx) = mpsc::channel(256);

        let socket = SocketTransport::new(socket_config, transport_events_tx.clone());
        let http_stream = HttpStreamTransport::new(http_stream_config, transport_events_tx.clone())?;
        let batch = BatchTransport::new(batch_config, transport_events_tx)?;

        let transports: Vec<Arc<dyn Transport>> = vec![Arc::new(socket), Arc::new(http_stream), Arc::new(batch)];

        let (manager, subscriber, mut monitor_rx) = FallbackManager::with_circuit_breaker_config(
            fallback_config,
            transports,
            buffer_config,
            replay_config,
            reconciler_config,
            monitor_config,
            circuit_breaker_config,
        );
        let manager = Arc::new(manager);

        let transport_events_manager = manager.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_events_rx.recv().await {
                transport_events_manager.handle_transport_event(event).await;
            }
            warn!("transport event channel closed, forwarding task exiting");
        });

        let monitor_events_manager = manager.clone();
        tokio::spawn(async move {
            while let Some(event) = monitor_rx.recv().await {
                monitor_events_manager.handle_monitor_event(event).await;
            }
            warn!("monitor event channel closed, forwarding task exiting");
        });

        Ok((Self { manager }, subscriber))
    }

    /// Subscribes an additional consumer to the relay's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.manager.subscribe()
    }

    /// Initializes the highest-priority available transport and starts a
    /// reconciler session.
    pub async fn start(&self, session_id: Option<String>) -> RelayResult<()> {
        self.manager.start(session_id).await
    }

    pub async fn send_audio(&self, payload: Bytes, opts: SendOptions) -> RelayResult<()> {
        self.manager.send_audio(payload, opts).await
    }

    pub async fn send_turn_complete(&self) -> RelayResult<()> {
        self.manager.send_turn_complete().await
    }

    /// Forces a transition off the current transport regardless of its
    /// reported health, e.g. on an operator-initiated drain.
    pub async fn force_fallback(&self, reason: &str) {
        self.manager.force_fallback(reason).await
    }

    pub fn get_statistics(&self) -> FallbackStatistics {
        self.manager.get_statistics()
    }

    /// Tears down every transport tier. Safe to call more than once.
    pub async fn destroy(&self) {
        self.manager.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wires_all_three_tiers_without_starting_any() {
        let mut config = RelayConfig::default();
        config.credential.api_key = "test-key".into();

        let (relay, _events) = TranscriptRelay::new(config).unwrap();

        // No transport has been started yet, so there is no current tier
        // and nothing has been transcribed.
        let stats = relay.get_statistics();
        assert_eq!(stats.current_transport, None);
        assert_eq!(stats.transport_switches, 0);

        relay.destroy().await;
    }

    #[tokio::test]
    async fn subscribe_returns_an_independent_receiver() {
        let mut config = RelayConfig::default();
        config.credential.api_key = "test-key".into();

        let (relay, first) = TranscriptRelay::new(config).unwrap();
        let second = relay.subscribe();

        // Both receivers are live ends of the same broadcast channel; neither
        // has missed anything since nothing has been emitted yet.
        assert_eq!(first.len(), 0);
        assert_eq!(second.len(), 0);

        relay.destroy().await;
    }
}
