//! Tripwire — weave provenance, BLAKE3 fingerprints, drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
