//! Client side of the scouting server contract.

pub mod api_types;
mod client;
#[cfg(test)]
pub mod fake;

pub use client::{HttpServer, ScoutingServer};
