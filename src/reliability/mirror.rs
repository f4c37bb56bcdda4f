use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Failed to open payload log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write payload log: {0}")]
    Write(#[from] std::io::Error),
}

/// Appends every uncompressed intake line to a diagnostic file.
///
/// Writing happens on a background task so the delivery worker never waits
/// on disk. The first write error is logged and disables the mirror.
#[derive(Debug)]
pub struct PayloadMirror {
    tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl PayloadMirror {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            if let Err(e) = write_lines(&path, rx).await {
                error!("Payload mirror disabled: {}", e);
            }
        });
        Self { tx, task }
    }

    pub fn record(&self, line: &Bytes) {
        // Send fails only after the writer gave up, which was already logged.
        let _ = self.tx.send(line.clone());
    }

    /// Waits until everything recorded so far has been written.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            debug!("Payload mirror task ended abnormally: {}", e);
        }
    }
}

async fn open(path: &Path) -> Result<File, MirrorError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| MirrorError::Open {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_lines(path: &Path, mut rx: mpsc::UnboundedReceiver<Bytes>) -> Result<(), MirrorError> {
    let mut file = open(path).await?;
    while let Some(line) = rx.recv().await {
        file.write_all(&line).await?;
        // Batch whatever is already queued before flushing.
        while let Ok(line) = rx.try_recv() {
            file.write_all(&line).await?;
        }
        file.flush().await?;
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lines_are_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payloads.ndjson");
        tokio::fs::write(&path, b"{\"existing\":true}\n").await.unwrap();

        let mirror = PayloadMirror::spawn(path.clone());
        mirror.record(&Bytes::from_static(b"{\"metadata\":{}}\n"));
        mirror.record(&Bytes::from_static(b"{\"span\":{\"id\":\"1\"}}\n"));
        mirror.shutdown().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(
            content,
            "{\"existing\":true}\n{\"metadata\":{}}\n{\"span\":{\"id\":\"1\"}}\n"
        );
    }

    #[tokio::test]
    async fn test_unwritable_path_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("payloads.ndjson");

        let mirror = PayloadMirror::spawn(path.clone());
        mirror.record(&Bytes::from_static(b"{\"span\":{}}\n"));
        mirror.shutdown().await;

        assert!(!path.exists());
    }
}
