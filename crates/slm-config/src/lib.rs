//! Process-wide runtime configuration shared by the StateLM crates.
//!
//! Two concerns live here: installing the `tracing` subscriber once per
//! process, and handing out seeded random number generators so training runs
//! can be replayed bit-for-bit.

pub mod determinism;
pub mod tracing;

pub use self::determinism::{rng_from_label, rng_from_optional, DeterminismConfig};
pub use self::tracing::{ensure_tracing, init_tracing, InitError};
