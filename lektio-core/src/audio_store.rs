use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub type AudioStoreResult<T> = Result<T, AudioStoreError>;

#[derive(Debug, Error)]
pub enum AudioStoreError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid encoded audio: {0}")]
    Decode(String),
    #[error("audio digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// Audio bytes in the portable text form the record store persists, plus the
/// integrity metadata computed at encode time.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub data: String,
    pub sha256: String,
    pub byte_len: u64,
}

impl EncodedAudio {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: STANDARD.encode(bytes),
            sha256: digest_hex(bytes),
            byte_len: bytes.len() as u64,
        }
    }
}

/// Reads the audio file fully and produces its portable encoding.
pub fn encode_file(path: &Path) -> AudioStoreResult<EncodedAudio> {
    let bytes = std::fs::read(path).map_err(|source| AudioStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let encoded = EncodedAudio::from_bytes(&bytes);
    debug!(
        path = %path.display(),
        encoded_kb = encoded.data.len() / 1024,
        "encoded audio for storage"
    );
    Ok(encoded)
}

/// Reverses the encoding and writes the audio bytes to `dest`.
pub fn decode_to_file(encoded: &str, dest: &Path) -> AudioStoreResult<PathBuf> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| AudioStoreError::Decode(err.to_string()))?;
    std::fs::write(dest, &bytes).map_err(|source| AudioStoreError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    debug!(path = %dest.display(), bytes = bytes.len(), "restored audio from encoded form");
    Ok(dest.to_path_buf())
}

/// Decodes in memory and checks the bytes against a previously stored digest.
pub fn verify_encoded(encoded: &str, expected_sha256: &str) -> AudioStoreResult<()> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| AudioStoreError::Decode(err.to_string()))?;
    let actual = digest_hex(&bytes);
    if actual != expected_sha256 {
        return Err(AudioStoreError::DigestMismatch {
            expected: expected_sha256.to_string(),
            actual,
        });
    }
    Ok(())
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip_reproduces_bytes_exactly() {
        let dir = TempDir::new().unwrap();
        let patterns: Vec<Vec<u8>> = vec![
            vec![],
            vec![0u8],
            vec![0xff; 3],
            b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec(),
            (0u8..=255).collect(),
            (0u8..=255).cycle().take(10_000).collect(),
        ];
        for (index, bytes) in patterns.iter().enumerate() {
            let source = dir.path().join(format!("in_{index}.mp3"));
            let restored = dir.path().join(format!("out_{index}.mp3"));
            std::fs::write(&source, bytes).unwrap();
            let encoded = encode_file(&source).unwrap();
            decode_to_file(&encoded.data, &restored).unwrap();
            assert_eq!(std::fs::read(&restored).unwrap(), *bytes);
            assert_eq!(encoded.byte_len, bytes.len() as u64);
        }
    }

    #[test]
    fn decode_rejects_invalid_text() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.mp3");
        let err = decode_to_file("not *** base64 ///", &dest).unwrap_err();
        assert!(matches!(err, AudioStoreError::Decode(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn encode_of_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.mp3");
        let err = encode_file(&missing).unwrap_err();
        match err {
            AudioStoreError::Io { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn verify_detects_tampered_payload() {
        let good = EncodedAudio::from_bytes(b"original audio bytes");
        verify_encoded(&good.data, &good.sha256).unwrap();

        let tampered = EncodedAudio::from_bytes(b"tampered audio bytes");
        let err = verify_encoded(&tampered.data, &good.sha256).unwrap_err();
        assert!(matches!(err, AudioStoreError::DigestMismatch { .. }));
    }
}
