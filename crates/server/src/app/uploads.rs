use crate::util::sanitize_filename;
use blake3::Hasher;
use comcore_crypto::encode_hex;
use std::path::PathBuf;
use tokio::fs;

pub const MAX_UPLOAD_SIZE: usize = 10 * 1024 * 1024; // 10 MB

#[derive(Debug)]
pub enum UploadError {
    TooLarge,
    Io(std::io::Error),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge => write!(f, "file too large"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Writes an upload into the upload area under a content-hash-prefixed,
/// sanitized filename. Returns the stored filename.
pub async fn save_file(dir: &str, name: &str, data: &[u8]) -> Result<String, UploadError> {
    if data.len() > MAX_UPLOAD_SIZE {
        return Err(UploadError::TooLarge);
    }
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = encode_hex(hasher.finalize().as_bytes());
    let filename = format!("{}-{}", &digest[..16], sanitize_filename(name));

    fs::create_dir_all(dir).await.map_err(|e| {
        tracing::error!(dir = %dir, error = %e, "failed to create uploads directory");
        UploadError::Io(e)
    })?;
    let path = PathBuf::from(dir).join(&filename);
    fs::write(&path, data).await.map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "failed to write upload");
        UploadError::Io(e)
    })?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "upload stored");
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_with_hashed_prefix() {
        let dir = std::env::temp_dir().join("comcore_uploads_test");
        let dir = dir.to_string_lossy().to_string();
        let stored = save_file(&dir, "../notes.txt", b"hello").await.unwrap();
        assert!(stored.ends_with("notes.txt"));
        assert_eq!(stored.split('-').next().unwrap().len(), 16);
        let written = tokio::fs::read(PathBuf::from(&dir).join(&stored)).await.unwrap();
        assert_eq!(written, b"hello");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() {
        let data = vec![0u8; MAX_UPLOAD_SIZE + 1];
        let err = save_file("unused", "big.bin", &data).await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge));
    }
}
