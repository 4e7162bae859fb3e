//! DCP message-status monitor.
//!
//! Ingests decoded GOES DCP messages, maintains a store of transmission
//! records behind a coalescing write-behind queue, and serves status and
//! performance reports over a line-oriented TCP protocol.

pub mod config;
pub mod errors;
pub mod groups;
pub mod ingest;
pub mod models;
pub mod pdt;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod scrub;
pub mod server;
pub mod storage;
