//! HTTP routes

pub mod aggregate;
pub mod directory;
pub mod health;
pub mod policy;
pub mod query;
pub mod token_routes;
