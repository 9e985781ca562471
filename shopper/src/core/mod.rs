//! Deterministic, pure logic shared by the agent phases.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures (and an injected RNG where choice is randomized) and return
//! outputs suitable for tests.

pub mod frontier;
pub mod links;
pub mod parse;
pub mod retry;
pub mod types;
