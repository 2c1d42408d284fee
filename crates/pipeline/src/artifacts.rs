//! Race-tolerant binary artifact exchange over the filesystem.
//!
//! The host-side export runs in a different execution context with no
//! completion signal visible here, so a file being loaded may not
//! exist yet, may be empty, or may still be mid-write. [`load`]
//! absorbs all three with a bounded retry policy; [`store`] writes
//! atomically (temp file + rename) so readers of the destination path
//! never observe a partial payload.
//!
//! [`load`]: ArtifactExchange::load
//! [`store`]: ArtifactExchange::store

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Tunable bounds for the race-tolerant read.
#[derive(Debug, Clone)]
pub struct ReadRetryPolicy {
    /// One-time delay before the first read attempt, giving the
    /// producer a head start.
    pub settle_delay: Duration,
    /// Delay between subsequent attempts.
    pub retry_delay: Duration,
    /// Attempts before the read is declared unrecoverable.
    pub max_attempts: u32,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            retry_delay: Duration::from_millis(300),
            max_attempts: 10,
        }
    }
}

/// Artifact I/O errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The file never became fully readable within the attempt bound.
    #[error("artifact {path} not readable after {attempts} attempts")]
    Unreadable { path: PathBuf, attempts: u32 },

    /// Writing the artifact (or creating its parent directory) failed.
    #[error("failed to write artifact {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single read attempt was rejected. Transient by design; only
/// exhausting the policy surfaces an error.
enum ReadFailure {
    Stat(std::io::Error),
    Empty,
    Read(std::io::Error),
    /// Fewer bytes read than the preceding stat reported -- the file
    /// is still being appended.
    Truncated { read: usize, expected: u64 },
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stat(e) => write!(f, "stat failed: {e}"),
            Self::Empty => write!(f, "file is empty"),
            Self::Read(e) => write!(f, "read failed: {e}"),
            Self::Truncated { read, expected } => {
                write!(f, "short read: {read} of {expected} bytes")
            }
        }
    }
}

/// Filesystem exchange between the host application and the core.
#[derive(Debug, Clone, Default)]
pub struct ArtifactExchange {
    policy: ReadRetryPolicy,
}

impl ArtifactExchange {
    pub fn new(policy: ReadRetryPolicy) -> Self {
        Self { policy }
    }

    /// Read a producer-owned file, tolerating the write/read race.
    ///
    /// Waits the settle delay once, then attempts up to the policy
    /// bound. An attempt is rejected when the file is missing, empty,
    /// unreadable, or shorter than its own stat said -- the last case
    /// is a mid-write race, not a fault. All waits are plain awaits,
    /// so dropping the future (cancellation) abandons the read.
    pub async fn load(&self, path: &Path) -> Result<Vec<u8>, ArtifactError> {
        tokio::time::sleep(self.policy.settle_delay).await;

        for attempt in 1..=self.policy.max_attempts {
            match read_complete(path).await {
                Ok(bytes) => {
                    tracing::debug!(path = %path.display(), size = bytes.len(), attempt, "Artifact loaded");
                    return Ok(bytes);
                }
                Err(reason) => {
                    tracing::debug!(
                        path = %path.display(),
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        %reason,
                        "Artifact not ready",
                    );
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        Err(ArtifactError::Unreadable {
            path: path.to_path_buf(),
            attempts: self.policy.max_attempts,
        })
    }

    /// Write `bytes` to `path`, creating missing parent directories.
    ///
    /// The payload goes to a temporary sibling first and is renamed
    /// into place, so no reader of `path` can observe a partial file.
    pub async fn store(&self, bytes: &[u8], path: &Path) -> Result<PathBuf, ArtifactError> {
        let write_failed = |source| ArtifactError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await.map_err(write_failed)?;
        tokio::fs::rename(&tmp, path).await.map_err(write_failed)?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "Artifact stored");
        Ok(path.to_path_buf())
    }
}

/// One read attempt: stat, read, and verify the sizes agree.
async fn read_complete(path: &Path) -> Result<Vec<u8>, ReadFailure> {
    let meta = tokio::fs::metadata(path).await.map_err(ReadFailure::Stat)?;
    if meta.len() == 0 {
        return Err(ReadFailure::Empty);
    }

    let bytes = tokio::fs::read(path).await.map_err(ReadFailure::Read)?;
    if bytes.len() as u64 != meta.len() {
        return Err(ReadFailure::Truncated {
            read: bytes.len(),
            expected: meta.len(),
        });
    }
    Ok(bytes)
}

/// Encode raw bytes for the service wire format.
pub fn to_wire(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a service wire payload back to raw bytes.
pub fn from_wire(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn fast_policy() -> ReadRetryPolicy {
        ReadRetryPolicy {
            settle_delay: Duration::from_millis(1),
            retry_delay: Duration::from_millis(5),
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("frame.png");
        let payload = vec![0x89u8, 0x50, 0x4e, 0x47, 0x00, 0xff, 0x7f];

        let exchange = ArtifactExchange::new(fast_policy());
        let stored = exchange.store(&payload, &path).await.unwrap();
        assert_eq!(stored, path);

        let loaded = exchange.load(&path).await.unwrap();
        assert_eq!(loaded, payload);
    }

    #[tokio::test]
    async fn wire_codecs_are_symmetric() {
        let payload = (0u8..=255).collect::<Vec<_>>();
        assert_eq!(from_wire(&to_wire(&payload)).unwrap(), payload);
    }

    #[tokio::test]
    async fn load_waits_out_an_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.png");
        tokio::fs::write(&path, b"").await.unwrap();

        // Producer fills the file in after a couple of retry windows.
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(12)).await;
            tokio::fs::write(&writer_path, b"complete payload").await.unwrap();
        });

        let exchange = ArtifactExchange::new(fast_policy());
        let loaded = exchange.load(&path).await.unwrap();
        assert_eq!(loaded, b"complete payload");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn load_gives_up_after_bounded_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.png");

        let exchange = ArtifactExchange::new(fast_policy());
        let err = exchange.load(&path).await.unwrap_err();
        assert_matches!(
            err,
            ArtifactError::Unreadable { attempts: 5, .. }
        );
    }

    #[tokio::test]
    async fn store_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");

        let exchange = ArtifactExchange::default();
        exchange.store(b"data", &path).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("out.png")]);
    }
}
