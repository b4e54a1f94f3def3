//! Wallet activity watcher.
//!
//! Consumes batches of Solana transaction events, matches them against a
//! tracked wallet list, forwards each matching transaction to enrichment at
//! most once, and reports arrival latency.

pub mod audit;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod enrich;
pub mod event;
pub mod identity;
pub mod ingest;
pub mod metrics;
pub mod tracked;

#[cfg(test)]
mod test_support;
