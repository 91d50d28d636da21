//! Per-job log: a header, the worker's raw output, then a footer.

use crate::events::Outcome;
use crate::types::JobDescriptor;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_LOG_NAME: &str = "job.log";

pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M").to_string()
}

/// Append-only log file owned by a single job.
pub struct JobLog {
    file: File,
    path: PathBuf,
}

impl JobLog {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn header(&mut self, job: &JobDescriptor) -> io::Result<()> {
        let header = format!("JOB: {}\nSTARTING: {}\n\n", job.canonical(), timestamp());
        self.file.write_all(header.as_bytes()).await?;
        self.file.flush().await
    }

    pub async fn note(&mut self, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await
    }

    pub async fn write_output(&mut self, blob: &[u8]) -> io::Result<()> {
        self.file.write_all(blob).await
    }

    /// Write the footer and sync. The log is closed when this returns.
    pub async fn finish(mut self, outcome: &Outcome) -> io::Result<()> {
        let code = outcome
            .exit_code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "None".to_string());
        let footer = format!(
            "\nFINISHED: {}\nEXIT CODE: {}\nOUTCOME: {}\n",
            timestamp(),
            code,
            outcome
        );
        self.file.write_all(footer.as_bytes()).await?;
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Failure;

    #[tokio::test]
    async fn header_body_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_LOG_NAME);

        let mut log = JobLog::open(&path).await.unwrap();
        log.header(&JobDescriptor::from("POLYGON((0 0,1 0,1 1,0 1,0 0))"))
            .await
            .unwrap();
        log.write_output(b"processing tile\n").await.unwrap();
        log.finish(&Outcome::failed(Failure::Exit { code: 4 }))
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("JOB: POLYGON((0 0,1 0,1 1,0 1,0 0))\nSTARTING: "));
        assert!(text.contains("\n\nprocessing tile\n\nFINISHED: "));
        assert!(text.contains("EXIT CODE: 4\nOUTCOME: failed (exit code 4)\n"));
    }

    #[tokio::test]
    async fn reruns_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_LOG_NAME);
        for outcome in [Outcome::Success { code: 0 }, Outcome::Skipped] {
            let mut log = JobLog::open(&path).await.unwrap();
            log.header(&JobDescriptor::from("t")).await.unwrap();
            log.finish(&outcome).await.unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("JOB: t\n").count(), 2);
        assert!(text.contains("EXIT CODE: 0\n"));
        assert!(text.contains("EXIT CODE: None\n"));
    }
}
