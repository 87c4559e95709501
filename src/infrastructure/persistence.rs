//! Persistence Sink
//!
//! Append-only, line-oriented destination for one session's data stream.
//! A single async mutex (capacity one) owns the file handle, so concurrent
//! writers are queued in arrival order and never interleave mid-line.

use crate::domain::errors::SinkError;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Timestamp layout used in generated file names (`ddMMyy_HHmmss`)
pub const FILE_TIMESTAMP_FORMAT: &str = "%d%m%y_%H%M%S";

/// `<deviceName>_<ddMMyy_HHmmss>.csv`
pub fn generate_file_name(device_name: &str, at: DateTime<Local>) -> String {
    format!("{}_{}.csv", device_name, at.format(FILE_TIMESTAMP_FORMAT))
}

struct Destination {
    file: File,
    path: PathBuf,
}

#[derive(Default)]
pub struct PersistenceSink {
    destination: Mutex<Option<Destination>>,
}

impl PersistenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `dir` if needed, create `file_name` inside it and write `title`
    ///
    /// Replaces any previously open destination.
    pub async fn open(
        &self,
        dir: &Path,
        file_name: &str,
        title: &str,
    ) -> Result<PathBuf, SinkError> {
        let path = dir.join(file_name);
        let io_err = |source| SinkError::IoFailure {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(dir).await.map_err(io_err)?;
        fs::write(&path, format!("{}\n", title))
            .await
            .map_err(io_err)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;

        let mut destination = self.destination.lock().await;
        *destination = Some(Destination {
            file,
            path: path.clone(),
        });
        info!("Save file created: {}", path.display());
        Ok(path)
    }

    /// Append one line and flush it to disk
    pub async fn write(&self, line: &str) -> Result<(), SinkError> {
        let mut guard = self.destination.lock().await;
        let destination = guard.as_mut().ok_or(SinkError::NotOpen)?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let result = async {
            destination.file.write_all(&buf).await?;
            destination.file.flush().await
        }
        .await;

        result.map_err(|source| {
            error!("Save failed on {}: {}", destination.path.display(), source);
            SinkError::IoFailure {
                path: destination.path.clone(),
                source,
            }
        })
    }

    /// Flush and release the destination; a no-op if nothing is open
    pub async fn close(&self) -> Result<(), SinkError> {
        let mut guard = self.destination.lock().await;
        if let Some(mut destination) = guard.take() {
            destination
                .file
                .sync_all()
                .await
                .map_err(|source| SinkError::IoFailure {
                    path: destination.path.clone(),
                    source,
                })?;
            debug!("Save file closed: {}", destination.path.display());
        }
        Ok(())
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.destination.lock().await.as_ref().map(|d| d.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn test_generated_file_name() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(
            generate_file_name("Device_2", at),
            "Device_2_070324_090502.csv"
        );
    }

    #[tokio::test]
    async fn test_open_creates_directories_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let sink = PersistenceSink::new();

        let path = sink.open(&nested, "out.csv", "Device Data:").await.unwrap();
        sink.write("1,2,3").await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Device Data:\n1,2,3\n");
        assert_eq!(sink.path().await, Some(path));
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let sink = PersistenceSink::new();
        assert!(matches!(sink.write("x").await, Err(SinkError::NotOpen)));
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let sink = PersistenceSink::new();
        let err = sink.open(&blocker, "out.csv", "t").await.unwrap_err();
        assert!(matches!(err, SinkError::IoFailure { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PersistenceSink::new();
        let path = sink.open(dir.path(), "order.csv", "T").await.unwrap();

        let lines: Vec<String> = (0..50).map(|i| format!("{:02},ax,ay,az", i)).collect();
        let writes = lines.iter().map(|l| sink.write(l));
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let written: Vec<&str> = contents.lines().skip(1).collect();
        assert_eq!(written, lines);
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_producers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(PersistenceSink::new());
        let path = sink.open(dir.path(), "par.csv", "T").await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|p| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        let line = format!("producer{}-{}-{}", p, i, "x".repeat(200));
                        sink.write(&line).await.unwrap();
                    }
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        sink.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let written: Vec<&str> = contents.lines().skip(1).collect();
        assert_eq!(written.len(), 100);
        for line in written {
            assert!(line.starts_with("producer"));
            assert!(line.ends_with(&"x".repeat(200)));
        }
    }
}
