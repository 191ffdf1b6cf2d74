//! Deterministic, pure logic of the contract loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return deterministic outputs suitable for tests.

pub mod decision;
pub mod feedback;
pub mod report;
pub mod state;
pub mod types;
