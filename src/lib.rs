//! Resilient streaming transcription transport.
//!
//! Wraps three transport tiers (persistent WebSocket, HTTP streaming, batch
//! HTTP) behind one [`core::FallbackManager`] that falls back through them
//! in priority order, replays buffered audio across a transition, and
//! reconciles the transcript fragments each tier produces into one ordered
//! stream. [`TranscriptRelay`] is the assembled entry point most callers
//! want; `core`/`config` stay public for callers who need to build a
//! `FallbackManager` over a custom transport set.

pub mod config;
pub mod core;
pub mod errors;
mod relay;

pub use config::{RelayConfig, RelayCredential, TransportEndpoints};
pub use relay::TranscriptRelay;
pub use core::{
    AudioSegment, AudioSegmentBuffer, AudioSegmentMetadata, BufferConfig, BufferStats,
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStats,
    CircuitState, ConflictResolutionStrategy, ConnectionMonitor, FallbackConfig, FallbackManager,
    FallbackStatistics, HealthStatus, MonitorConfig, MonitorEvent, ReconcilerConfig,
    ReconciliationResult, RelayEvent, ReplayConfig, ReplayEngine, ReplayEvent, ReplayHandler,
    ReplayMode, ReplayStats, RetryContext, RetryExecutor, RetryMetrics, RetryPolicy,
    SegmentPriority, SendOptions, Transport, TransportEvent, TransportId, TransportState,
    TranscriptReconciler, TranscriptSegment,
};
pub use errors::{RelayError, RelayErrorKind, RelayResult};
