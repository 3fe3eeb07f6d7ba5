//! Queue handlers. Both are stateless: everything they coordinate on lives
//! in the store, so any number of them can run side by side.

pub mod enrich;
pub mod fetch;

pub use enrich::EnrichmentWorker;
pub use fetch::FetchWorker;
