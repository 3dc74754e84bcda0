//! The three concurrent loops a work-coordinator instance hosts alongside
//! its heartbeat (C6 publisher, C7 consumer, C8 perspective runner), plus
//! the Prometheus metrics shared across them.

pub mod consumer;
pub mod metrics;
pub mod perspective;
pub mod publisher;

pub use consumer::{ConsumerScope, ConsumerWorker, Receptor, ReceptorError};
pub use metrics::WorkerMetrics;
pub use perspective::{EventReader, EventReaderError, EventStoreReader, PerspectiveRunner, Projection, ProjectionError};
pub use publisher::PublisherWorker;
