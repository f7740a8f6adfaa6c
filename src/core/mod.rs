pub mod buffer;
pub mod circuit_breaker;
pub mod fallback;
pub mod monitor;
pub mod reconciler;
pub mod replay;
pub mod retry;
pub mod transport;

pub use buffer::{AudioSegment, AudioSegmentBuffer, AudioSegmentMetadata, BufferConfig, BufferStats, SegmentPriority};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStats, CircuitState};
pub use fallback::{FallbackConfig, FallbackManager, FallbackStatistics, RelayEvent};
pub use monitor::{ConnectionMonitor, HealthStatus, MonitorConfig, MonitorEvent};
pub use reconciler::{ConflictResolutionStrategy, ReconcilerConfig, ReconciliationResult, TranscriptReconciler, TranscriptSegment};
pub use replay::{ReplayConfig, ReplayEngine, ReplayEvent, ReplayHandler, ReplayMode, ReplayStats};
pub use retry::{RetryContext, RetryExecutor, RetryMetrics, RetryPolicy};
pub use transport::{SendOptions, Transport, TransportEvent, TransportId, TransportState};
