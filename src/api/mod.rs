//! HTTP surface: the query ingress, health, stats, and metrics endpoints.

pub mod middleware;
pub mod routes;
pub mod server;
pub mod types;

pub use server::ApiServer;
