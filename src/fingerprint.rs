//! Content fingerprints for data product identity.
//!
//! The registry deduplicates data products by (fingerprint, size). Regular
//! files hash their content; directory products (search/fold output trees)
//! hash their canonical path, since the original system never content-hashed
//! derived trees and the uniqueness key only has to be stable per location.

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Identity key of a data product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Hex md5 digest.
    pub digest: String,
    /// Content length in bytes; zero for directory or unreadable products.
    pub size_bytes: u64,
}

/// Fingerprint a path, falling back to a path-derived digest when the
/// target is a directory or cannot be read.
pub fn fingerprint_path(path: &Path) -> Fingerprint {
    if path.is_file() {
        if let Ok(fp) = fingerprint_file(path) {
            return fp;
        }
    }
    Fingerprint {
        digest: format!("{:x}", md5::compute(path.to_string_lossy().as_bytes())),
        size_bytes: 0,
    }
}

fn fingerprint_file(path: &Path) -> std::io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size_bytes = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
        size_bytes += n as u64;
    }
    Ok(Fingerprint {
        digest: format!("{:x}", ctx.compute()),
        size_bytes,
    })
}
