// Core types for the eventgate ingestion service
//
// This crate holds everything the other crates agree on:
// - Event: the unit of work, from intake to persisted row
// - validation of intake requests
// - PriorityRouter: high/normal classification
// - EventHandler registry for per-type fan-out
// - KvStore: the shared keyed-KV abstraction (idempotency, retry
//   counters, breaker state all live behind it)

pub mod event;
pub mod handler;
pub mod kv;
pub mod router;
pub mod validate;

pub use event::{Event, EventSource, EventStatus, NewEvent, HIGH_PRIORITY_THRESHOLD};
pub use handler::{EventHandler, HandlerError, HandlerFailure, HandlerRegistry};
pub use kv::{InMemoryKv, KvError, KvStore};
pub use router::{PriorityRouter, QueueKind, RouteDecision};
pub use validate::{FieldError, ValidationErrors};
