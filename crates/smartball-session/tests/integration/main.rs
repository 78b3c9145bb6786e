//! Integration test entry point for smartball-session.
//!
//! Every test drives the real session engine against a simulated device on
//! virtual time. Run with: cargo test -p smartball-session --test integration

mod resume;
mod transfer;
