//! Federation protocol
//!
//! Node-to-node directory operations: registration with push-up replication,
//! deletion, relocation, federated search, and recursive aggregation queries.

pub mod client;
pub mod engine;
pub mod query;
pub mod reduce;

pub use client::{join_url, PeerClient};
pub use engine::{Engine, SearchOutcome, SearchParams};
pub use query::{Operation, QueryFilter, QueryScript, TimeRange};
pub use reduce::{reduce, CompressedThing, Datum};
