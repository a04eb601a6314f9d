// src/discovery/checksum.rs

use std::fs::File;
use std::io::Read;
use std::path::Path;

use blake3::Hasher;

use crate::errors::Result;

/// blake3 hex digest of a pipeline binary.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file = File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
