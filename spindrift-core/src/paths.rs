//! Per-stream filesystem layout.
//!
//! Computes and prepares the two sibling directory trees every stream owns:
//! `streams/<hash>/` for the torrent download and `hls/<hash>/` for the
//! packager output. Directory names are the first 8 hex digits of the MD5
//! of the stream ID, which keeps paths short and filesystem-safe while the
//! registry continues to key on the full UUID.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors from directory preparation and teardown.
///
/// The write probe gets a distinct kind: a silently unwritable directory
/// would otherwise surface much later as an opaque packager error.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Directory creation failed
    #[error("failed to create directory {path}: {source}")]
    Create {
        /// The directory being created
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The directory exists but the write probe could not be created
    #[error("directory {path} is not writable: {source}")]
    WriteProbe {
        /// The directory being probed
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Recursive removal failed
    #[error("failed to remove {path}: {source}")]
    Remove {
        /// The tree being removed
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// Stateless path service over the configured temp root.
///
/// All mutation is on the filesystem; the service itself holds only the
/// root path.
#[derive(Debug, Clone)]
pub struct StreamPaths {
    root: PathBuf,
}

impl StreamPaths {
    /// Creates a path service rooted at `temp_root`.
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            root: temp_root.into(),
        }
    }

    /// The configured temp root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First 8 hex digits of the MD5 of the stream ID's string form.
    pub fn short_hash(stream_id: Uuid) -> String {
        let digest = Md5::digest(stream_id.to_string().as_bytes());
        digest[..4].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Download directory for a stream: `<root>/streams/<hash>`.
    pub fn stream_dir(&self, stream_id: Uuid) -> PathBuf {
        self.root.join("streams").join(Self::short_hash(stream_id))
    }

    /// HLS output directory for a stream: `<root>/hls/<hash>`.
    pub fn hls_dir(&self, stream_id: Uuid) -> PathBuf {
        self.root.join("hls").join(Self::short_hash(stream_id))
    }

    /// Playlist path inside the stream's HLS directory.
    pub fn playlist_path(&self, stream_id: Uuid) -> PathBuf {
        self.hls_dir(stream_id).join("playlist.m3u8")
    }

    /// Path of segment `index` inside the stream's HLS directory.
    pub fn segment_path(&self, stream_id: Uuid, index: u32) -> PathBuf {
        self.hls_dir(stream_id).join(format!("segment{index:03}.ts"))
    }

    /// Creates `dir` (with ancestors, mode `0o755`) and proves it is
    /// writable by creating and deleting a probe file.
    ///
    /// # Errors
    ///
    /// - `PathError::Create` - the directory could not be created
    /// - `PathError::WriteProbe` - the probe file could not be written
    pub fn ensure_dir(&self, dir: &Path) -> Result<(), PathError> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder.create(dir).map_err(|source| PathError::Create {
            path: dir.display().to_string(),
            source,
        })?;

        let probe = dir.join(".write-probe");
        std::fs::write(&probe, b"probe").map_err(|source| PathError::WriteProbe {
            path: dir.display().to_string(),
            source,
        })?;
        if let Err(e) = std::fs::remove_file(&probe) {
            warn!("Failed to remove write probe {}: {}", probe.display(), e);
        }

        debug!("Prepared directory {}", dir.display());
        Ok(())
    }

    /// Creates both of a stream's directories.
    ///
    /// # Errors
    ///
    /// - `PathError::Create` / `PathError::WriteProbe` - see [`Self::ensure_dir`]
    pub fn ensure_stream_dirs(&self, stream_id: Uuid) -> Result<(), PathError> {
        self.ensure_dir(&self.stream_dir(stream_id))?;
        self.ensure_dir(&self.hls_dir(stream_id))
    }

    /// Deletes both of a stream's directory trees. Idempotent: missing
    /// trees are not an error.
    ///
    /// # Errors
    ///
    /// - `PathError::Remove` - a tree exists but could not be deleted
    pub fn remove_stream_dirs(&self, stream_id: Uuid) -> Result<(), PathError> {
        for dir in [self.stream_dir(stream_id), self.hls_dir(stream_id)] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!("Removed {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(PathError::Remove {
                        path: dir.display().to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_short_hash_is_stable_and_short() {
        let id = Uuid::new_v4();
        let a = StreamPaths::short_hash(id);
        let b = StreamPaths::short_hash(id);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_hash_differs_between_streams() {
        let a = StreamPaths::short_hash(Uuid::new_v4());
        let b = StreamPaths::short_hash(Uuid::new_v4());
        assert_ne!(a, b);
    }

    #[test]
    fn test_directory_layout() {
        let paths = StreamPaths::new("/tmp/spindrift");
        let id = Uuid::new_v4();
        let hash = StreamPaths::short_hash(id);

        assert_eq!(
            paths.stream_dir(id),
            PathBuf::from(format!("/tmp/spindrift/streams/{hash}"))
        );
        assert_eq!(
            paths.playlist_path(id),
            PathBuf::from(format!("/tmp/spindrift/hls/{hash}/playlist.m3u8"))
        );
        assert_eq!(
            paths.segment_path(id, 7),
            PathBuf::from(format!("/tmp/spindrift/hls/{hash}/segment007.ts"))
        );
    }

    #[test]
    fn test_ensure_and_remove_stream_dirs() {
        let temp = tempdir().unwrap();
        let paths = StreamPaths::new(temp.path());
        let id = Uuid::new_v4();

        paths.ensure_stream_dirs(id).unwrap();
        assert!(paths.stream_dir(id).is_dir());
        assert!(paths.hls_dir(id).is_dir());

        paths.remove_stream_dirs(id).unwrap();
        assert!(!paths.stream_dir(id).exists());
        assert!(!paths.hls_dir(id).exists());

        // Idempotent: removing again succeeds
        paths.remove_stream_dirs(id).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_write_probe_fails_on_readonly_dir() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let paths = StreamPaths::new(temp.path());
        let dir = temp.path().join("frozen");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        let result = paths.ensure_dir(&dir);
        // Restore so tempdir cleanup works before asserting
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(result, Err(PathError::WriteProbe { .. })));
    }
}
