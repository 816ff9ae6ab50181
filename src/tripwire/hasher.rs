//! WF-014: BLAKE3 fingerprints of linked units.

use crate::linker::LinkedUnit;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a linked unit: its name, interfaces, and every emitted form in
/// output order. Returns `"blake3:{hex}"`.
pub fn hash_unit(unit: &LinkedUnit) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(unit.type_name.as_bytes());
    for iface in &unit.interfaces {
        hasher.update(b"\0");
        hasher.update(iface.as_bytes());
    }
    hasher.update(b"\n");
    for m in &unit.members {
        hasher.update(m.callable.as_bytes());
        hasher.update(b"(");
        hasher.update(m.params.join(",").as_bytes());
        hasher.update(b")");
        if let Some(ref body) = m.body {
            hasher.update(b"\0");
            hasher.update(body.to_string().as_bytes());
        }
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Hash several hashes into one (order matters).
pub fn composite_hash(hashes: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for h in hashes {
        hasher.update(h.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}
