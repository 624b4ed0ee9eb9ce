// Drain workers for eventgate
//
// The processor turns deliveries into persisted rows (idempotently,
// under one store transaction with handler fan-out); the supervisor
// runs a drain loop until a shutdown signal, the memory cap, the
// uptime cap, or a restart flag ends it.

pub mod processor;
pub mod supervisor;

pub use processor::{EventProcessor, ProcessError, ProcessOutcome};
pub use supervisor::{DrainSource, ExitReason, Supervisor, WorkerConfig};
