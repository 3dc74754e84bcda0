/// Resilience patterns shared by anything making an external call: database
/// queries, transport publish/subscribe, receptor invocation.
///
/// - **Timeout**: enforces time limits on all external calls.
/// - **Retry**: exponential backoff with jitter for transient failures.
/// - **Circuit Breaker**: fails fast once an error threshold is reached.
/// - **Preset Configurations**: pre-tuned settings per call kind (database,
///   Kafka, etc.) rather than ad-hoc constants at each call site.
///
/// # Example: Database Query with Timeout
///
/// ```rust,no_run
/// use resilience::{presets, timeout::with_timeout_result};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::database_config();
///
///     let result = with_timeout_result(
///         config.timeout.duration,
///         async {
///             // Your database query
///             Ok::<_, String>(())
///         }
///     ).await;
/// }
/// ```

pub mod circuit_breaker;
pub mod metrics;
pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use presets::{ServiceConfig, database_config, http_external_config, kafka_config, object_storage_config, redis_config};
pub use retry::{with_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutConfig, TimeoutError};
