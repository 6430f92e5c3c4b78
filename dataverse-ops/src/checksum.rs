use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::admin::AdminApi;
use crate::error::{OpsError, Result};

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Accepts a bare digest, `sha256:<digest>`, or a `sha256sum` line.
fn normalize_expected(expected: &str) -> String {
    let token = expected.split_whitespace().next().unwrap_or("");
    token
        .strip_prefix("sha256:")
        .unwrap_or(token)
        .to_ascii_lowercase()
}

/// Verify `path` against `expected`; on mismatch the file is deleted.
pub fn verify(path: &Path, expected: &str) -> Result<()> {
    let expected = normalize_expected(expected);
    let actual = sha256_file(path)?;
    if actual == expected {
        return Ok(());
    }
    if let Err(err) = fs::remove_file(path) {
        tracing::warn!("could not delete {}: {err}", path.display());
    }
    Err(OpsError::ChecksumMismatch {
        artifact: path.to_path_buf(),
        expected,
        actual,
    })
}

/// Last path segment of a download URL, without query string.
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|seg| !seg.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Download `url` into `dir` and verify it.
pub fn fetch_verified(
    api: &dyn AdminApi,
    url: &str,
    expected: &str,
    dir: &Path,
) -> Result<PathBuf> {
    let dest = dir.join(file_name_from_url(url));
    let bytes = api.download(url, &dest)?;
    tracing::info!("downloaded {} ({bytes} bytes)", dest.display());
    verify(&dest, expected)?;
    tracing::info!("checksum verified for {}", dest.display());
    Ok(dest)
}
