use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("failed to read {path} for hashing: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 of the whole file at `path`, hex encoded.
///
/// Always covers the complete file, so a resumed download hashes the bytes
/// from earlier sessions as well.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let read_err = |source| IntegrityError::Read {
        path: path.display().to_string(),
        source,
    };

    let file = File::open(path).await.map_err(read_err)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buffer).await.map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
