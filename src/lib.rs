// Torii media gateway library

pub mod auth;
pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod rate_limit;
pub mod resolver;
pub mod rewrite;
pub mod server;
pub mod store;
pub mod upstream;
