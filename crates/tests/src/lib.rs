//! Cross-crate scenario tests for the media bridge audio manager
//!
//! Every scenario runs against the in-memory audio server, so none of them
//! needs PipeWire or a PTP daemon.

#[cfg(test)]
mod common;
#[cfg(test)]
mod isolation_integration;
#[cfg(test)]
mod reconcile_integration;
