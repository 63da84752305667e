//! `gatebridge`: bridges a chat surface to an agent gateway.
//!
//! The [`gateway`] client multiplexes requests, events and per-run streams
//! over one connection; the [`aggregator`] turns a run's fragments into
//! chat replies; the [`bridge`] ties one inbound chat message to one turn.

pub mod aggregator;
pub mod bridge;
pub mod chat;
pub mod config;
pub mod gateway;
pub mod transport;
