// Event store layer
//
// The EventStore trait is the persistence seam: PostgresEventStore is
// the production implementation (sqlx), InMemoryEventStore backs unit
// tests. The processing transaction (insert -> handler fan-out ->
// mark processed) lives behind persist_with_dispatch so both
// implementations give the same crash-atomicity contract.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryEventStore;
pub use models::{EventRow, StatusCount};
pub use postgres::PostgresEventStore;
pub use store::{DispatchFuture, EventStore, ProcessReport, StoreError};
