use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

/// Running SHA-256 and byte count of a body as it is written.
#[derive(Default)]
pub struct BodyDigest {
    hasher: Sha256,
    bytes: u64,
}

impl BodyDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Returns (byte count, lowercase hex digest).
    pub fn finish(self) -> (u64, String) {
        (self.bytes, format!("{:x}", self.hasher.finalize()))
    }
}

/// Compute SHA256 hash of a file asynchronously.
pub async fn sha256_sum(path: &Path) -> std::io::Result<String> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut digest = BodyDigest::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        digest.update(&buffer[..n]);
    }
    Ok(digest.finish().1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_and_streamed_digests_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let mut digest = BodyDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        let (bytes, streamed) = digest.finish();

        assert_eq!(bytes, 11);
        assert_eq!(streamed, sha256_sum(&path).await.unwrap());
        assert_eq!(
            streamed,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
