//! Weft — deterministic aspect weaving.
//!
//! Ordered aspect layers. Snapshot-per-layer transformation folding.
//! Chain linking with synthetic forms, inlining, and BLAKE3 fingerprints.

pub mod aspects;
pub mod cli;
pub mod core;
pub mod invoke;
pub mod linker;
pub mod model;
pub mod tripwire;
