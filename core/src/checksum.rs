use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

const HASH_BUFFER: usize = 1024 * 64;
/// AutoV2 is the first ten hex digits of the SHA-256.
const AUTOV2_LEN: usize = 10;

pub fn sha256_file(path: &Path) -> CoreResult<String> {
    sha256_file_with_progress(path, |_, _| {})
}

/// Streams the file through SHA-256, reporting `(hashed, total)` bytes.
pub fn sha256_file_with_progress<F>(path: &Path, mut progress: F) -> CoreResult<String>
where
    F: FnMut(u64, u64),
{
    let file = File::open(path)?;
    let total = file.metadata().map(|meta| meta.len()).unwrap_or(0);
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    let mut hashed = 0u64;
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        hashed += read as u64;
        progress(hashed, total);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// The hash a hub published for a file, normalized to what we can verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedHash {
    Sha256(String),
    AutoV2(String),
}

impl ExpectedHash {
    /// Picks the strongest verifiable hash out of a hub's hash map. Keys are
    /// matched case-insensitively; unknown algorithms are ignored.
    pub fn from_map(hashes: &BTreeMap<String, String>) -> Option<Self> {
        let lookup = |name: &str| {
            hashes
                .iter()
                .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.trim().is_empty())
                .map(|(_, value)| value.trim().to_ascii_lowercase())
        };
        if let Some(value) = lookup("sha256") {
            return Some(ExpectedHash::Sha256(value));
        }
        lookup("autov2").map(ExpectedHash::AutoV2)
    }

    pub fn matches(&self, actual_sha256: &str) -> bool {
        match self {
            ExpectedHash::Sha256(expected) => expected.eq_ignore_ascii_case(actual_sha256),
            ExpectedHash::AutoV2(expected) => actual_sha256
                .get(..AUTOV2_LEN)
                .map(|prefix| prefix.eq_ignore_ascii_case(expected))
                .unwrap_or(false),
        }
    }
}

/// Fails with [`CoreError::Integrity`] when the file does not hash to the
/// expected value. Returns the computed SHA-256.
pub fn verify_file(path: &Path, expected: &ExpectedHash) -> CoreResult<String> {
    let actual = sha256_file(path)?;
    if !expected.matches(&actual) {
        return Err(CoreError::Integrity(format!(
            "{} hashes to {}, expected {:?}",
            path.display(),
            actual,
            expected
        )));
    }
    Ok(actual)
}
