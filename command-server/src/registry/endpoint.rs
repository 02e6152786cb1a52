//! Endpoint naming
//!
//! Every canonical directory maps to a fixed key: the first 16 bytes of the
//! SHA-256 of its path, hex encoded. The key names both the registration
//! record (`<key>.json`) and the socket (`<key>.sock`), so the same directory
//! always lands on the same address and distinct directories never collide.
//! 32 hex characters keep socket paths well under the `sun_path` limit.

use std::path::Path;

use sha2::{Digest, Sha256};

const KEY_BYTES: usize = 16;

/// Stable key for a canonical directory path
pub fn directory_key(canonical_directory: &Path) -> String {
    let digest = Sha256::digest(path_bytes(canonical_directory));
    digest[..KEY_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}
