//! Observability for round coordination
//!
//! - Structured JSON logging with typed events
//! - Monotonic counters
//! - Begin/complete scopes around round phases
//!
//! Observability never fails the operation it observes.
//!
//! ```ignore
//! use clusterround::observability::{Event, Logger, MetricsRegistry};
//!
//! Logger::emit(Event::ReplicaWaitTimeout, &[("domain", "main")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_replica_wait_timeouts();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::ObservationScope;
