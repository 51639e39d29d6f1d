//! Career-guidance chat backend: grounds each completion in live platform
//! data, routes it across two interchangeable providers, relays streamed
//! replies as Server-Sent Events and stores each exchange transactionally.

pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod providers;
pub mod server;
pub mod streaming;
