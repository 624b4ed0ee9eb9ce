// HTTP layer for eventgate
//
// events: the ingest façade and per-event status
// system: health, metrics exposition and diagnostics

pub mod events;
pub mod system;
