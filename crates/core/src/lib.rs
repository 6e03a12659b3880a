//! Pure domain logic for job admission and timeout budgeting.
//!
//! Nothing in this crate performs I/O or spawns tasks; time is read through
//! the [`clock::Clock`] seam so every module is deterministic under test.

pub mod admission;
pub mod backoff;
pub mod budget;
pub mod cache;
pub mod clock;
pub mod error;
pub mod hashing;
pub mod types;
