//! Deterministic fingerprinting of task invocations.
//!
//! The fingerprint is the cache key: identical inputs across runs must
//! produce identical keys, so nothing time- or process-dependent may be
//! absorbed. The hash function is fixed per zr version; changing it
//! invalidates every existing cache entry.

use std::{hash::Hasher, io, path::Path};

use twox_hash::XxHash64;

use crate::task_graph::TaskDefinition;

// Keeps "ab"+"c" from colliding with "a"+"bc"
const SEPARATOR: [u8; 1] = [0x1f];

/// Computes the cache fingerprint for a task invocation, absorbing in a
/// canonical order: command, working directory, env pairs sorted by key,
/// toolchain specs in array order, then declared input file contents.
pub fn fingerprint(task: &TaskDefinition) -> io::Result<String> {
    let mut hasher = XxHash64::with_seed(0);

    hasher.write(task.cmd.as_bytes());
    hasher.write(&SEPARATOR);
    hasher.write(task.cwd.as_deref().unwrap_or_default().as_bytes());
    hasher.write(&SEPARATOR);

    // Sorting makes the key independent of env insertion order
    let mut pairs: Vec<String> = task
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    pairs.sort();
    for pair in &pairs {
        hasher.write(pair.as_bytes());
        hasher.write(&SEPARATOR);
    }

    // Toolchain order is significant: earlier entries shadow later ones
    // on PATH, so reordering is a different invocation
    for spec in &task.toolchain {
        hasher.write(spec.as_bytes());
        hasher.write(&SEPARATOR);
    }

    for input in &task.inputs {
        hasher.write(hash_file(Path::new(input))?.as_bytes());
        hasher.write(&SEPARATOR);
    }

    Ok(format!("{:016x}", hasher.finish()))
}

/// Content hash of a single file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let contents = std::fs::read(path)?;
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&contents);
    Ok(format!("{:016x}", hasher.finish()))
}
