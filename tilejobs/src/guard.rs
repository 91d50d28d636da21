//! Idempotency guard.
//!
//! Every job owns `<output root>/<digest>/`. A `DONE` marker in that directory
//! certifies that the job's artifacts are complete, which lets a re-run skip it.
//! The marker records the worker fingerprint and the artifact listing, so a changed
//! worker definition or a damaged output directory is detected rather than trusted.

use crate::digest::ContentDigest;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const MARKER_NAME: &str = "DONE";
const MARKER_TMP_NAME: &str = "DONE.tmp";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Relative to the job directory, `/`-separated.
    pub path: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub digest: ContentDigest,
    pub fingerprint: ContentDigest,
    pub completed_at: String,
    pub artifacts: Vec<Artifact>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerState {
    Absent,
    Complete,
    /// A marker exists but does not describe what is on disk.
    Stale(String),
}

/// A job's dedicated output directory.
#[derive(Clone, Debug)]
pub struct JobDir {
    digest: ContentDigest,
    path: PathBuf,
}

impl JobDir {
    pub fn locate(output_root: &Path, digest: ContentDigest) -> Self {
        let path = output_root.join(&digest);
        Self { digest, path }
    }

    /// Create the directory if needed.
    pub async fn prepare(output_root: &Path, digest: ContentDigest) -> io::Result<Self> {
        let dir = Self::locate(output_root, digest);
        fs::create_dir_all(&dir.path).await?;
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    pub fn marker_path(&self) -> PathBuf {
        self.path.join(MARKER_NAME)
    }

    /// Inspect the marker against the current worker fingerprint and the files on disk.
    pub async fn check(&self, fingerprint: &ContentDigest) -> io::Result<MarkerState> {
        let raw = match fs::read_to_string(self.marker_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Absent),
            Err(e) => return Err(e),
        };
        // a bare DONE file carries no record to verify against
        if raw.trim().is_empty() {
            return Ok(MarkerState::Complete);
        }
        let marker: CompletionMarker = match serde_json::from_str(&raw) {
            Ok(marker) => marker,
            Err(e) => return Ok(MarkerState::Stale(format!("unreadable marker: {e}"))),
        };
        if marker.digest != self.digest {
            return Ok(MarkerState::Stale(format!(
                "marker belongs to job {}",
                marker.digest.short()
            )));
        }
        if &marker.fingerprint != fingerprint {
            return Ok(MarkerState::Stale(
                "worker definition changed since completion".to_string(),
            ));
        }
        for artifact in &marker.artifacts {
            match fs::metadata(self.path.join(&artifact.path)).await {
                Ok(meta) if meta.len() == artifact.size => {}
                Ok(meta) => {
                    return Ok(MarkerState::Stale(format!(
                        "artifact {} is {} bytes, expected {}",
                        artifact.path,
                        meta.len(),
                        artifact.size
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(MarkerState::Stale(format!(
                        "artifact {} is missing",
                        artifact.path
                    )))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(MarkerState::Complete)
    }

    /// Certify the job. Call only after the work has fully succeeded.
    ///
    /// The marker is written to a temporary file, synced, then renamed into place.
    pub async fn mark_complete(
        &self,
        fingerprint: &ContentDigest,
        log_name: &str,
    ) -> io::Result<CompletionMarker> {
        let marker = CompletionMarker {
            digest: self.digest.clone(),
            fingerprint: fingerprint.clone(),
            completed_at: chrono::Local::now().to_rfc3339(),
            artifacts: self.list_artifacts(log_name).await?,
        };
        let body = serde_json::to_vec_pretty(&marker)?;

        let tmp = self.path.join(MARKER_TMP_NAME);
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.marker_path()).await?;
        if let Ok(dir) = fs::File::open(&self.path).await {
            let _ = dir.sync_all().await;
        }
        Ok(marker)
    }

    async fn list_artifacts(&self, log_name: &str) -> io::Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        let mut pending = vec![self.path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let rel = relative_name(&self.path, &entry.path());
                if rel == MARKER_NAME || rel == MARKER_TMP_NAME || rel == log_name {
                    continue;
                }
                artifacts.push(Artifact {
                    path: rel,
                    size: meta.len(),
                });
            }
        }
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(artifacts)
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn fingerprint(s: &str) -> ContentDigest {
        ContentDigest::of(s.as_bytes())
    }

    async fn job_dir(root: &Path) -> JobDir {
        JobDir::prepare(root, ContentDigest::of(b"POLYGON((0 0,1 0,1 1,0 1,0 0))"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn absent_until_marked() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(root.path()).await;
        assert!(dir.path().is_dir());
        assert_eq!(dir.check(&fingerprint("v1")).await.unwrap(), MarkerState::Absent);

        fs::write(dir.path().join("metrics.tif"), b"raster").await.unwrap();
        fs::create_dir(dir.path().join("chm")).await.unwrap();
        fs::write(dir.path().join("chm/chm.tif"), b"chm").await.unwrap();
        fs::write(dir.path().join("job.log"), b"JOB: x\n").await.unwrap();

        let marker = dir.mark_complete(&fingerprint("v1"), "job.log").await.unwrap();
        assert_eq!(
            marker.artifacts,
            vec![
                Artifact { path: "chm/chm.tif".into(), size: 3 },
                Artifact { path: "metrics.tif".into(), size: 6 },
            ]
        );
        assert!(!dir.path().join(MARKER_TMP_NAME).exists());
        assert_eq!(dir.check(&fingerprint("v1")).await.unwrap(), MarkerState::Complete);
    }

    #[tokio::test]
    async fn changed_worker_invalidates_marker() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(root.path()).await;
        dir.mark_complete(&fingerprint("v1"), "job.log").await.unwrap();
        assert_matches!(dir.check(&fingerprint("v2")).await.unwrap(), MarkerState::Stale(_));
    }

    #[tokio::test]
    async fn damaged_artifacts_invalidate_marker() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(root.path()).await;
        fs::write(dir.path().join("a.tif"), b"aaaa").await.unwrap();
        fs::write(dir.path().join("b.tif"), b"bbbb").await.unwrap();
        dir.mark_complete(&fingerprint("v1"), "job.log").await.unwrap();

        fs::write(dir.path().join("a.tif"), b"a").await.unwrap();
        assert_matches!(
            dir.check(&fingerprint("v1")).await.unwrap(),
            MarkerState::Stale(reason) if reason.contains("a.tif")
        );

        fs::write(dir.path().join("a.tif"), b"aaaa").await.unwrap();
        fs::remove_file(dir.path().join("b.tif")).await.unwrap();
        assert_matches!(
            dir.check(&fingerprint("v1")).await.unwrap(),
            MarkerState::Stale(reason) if reason.contains("b.tif is missing")
        );
    }

    #[tokio::test]
    async fn bare_marker_is_trusted() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(root.path()).await;
        fs::write(dir.marker_path(), b"").await.unwrap();
        assert_eq!(dir.check(&fingerprint("any")).await.unwrap(), MarkerState::Complete);
    }

    #[tokio::test]
    async fn garbage_marker_is_stale() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(root.path()).await;
        fs::write(dir.marker_path(), b"{not json").await.unwrap();
        assert_matches!(dir.check(&fingerprint("v1")).await.unwrap(), MarkerState::Stale(_));
    }
}
