//! Arbor - federated directory for thing descriptions
//!
//! Directories form a tree. Each node stores thing descriptions, replicates
//! sufficiently public ones toward the root, answers federated searches and
//! recursive aggregation queries over its subtree, and guards access with
//! attribute-based policies.

pub mod abac;
pub mod config;
pub mod federation;
pub mod model;
pub mod registry;
pub mod routes;
pub mod server;
pub mod token;
pub mod topology;
pub mod types;
