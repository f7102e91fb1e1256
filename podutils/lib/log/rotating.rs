//! Log rotation implementation for the podcore runtime.
//!
//! This module provides a rotating log implementation that automatically rotates log files
//! when they reach a specified size. The rotation process involves:
//! 1. Renaming the current log file to .old extension
//! 2. Creating a new empty log file
//! 3. Continuing writing to the new file
//!
//! Writes are funneled through a channel so that synchronous producers (such as the
//! stdout/stderr pump tasks of a supervised process) never block on file I/O.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use tokio::{
    fs::{rename, OpenOptions},
    io::AsyncWriteExt,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::ROTATED_LOG_EXTENSION;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default maximum size of a log file before rotation, in bytes.
pub const DEFAULT_LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A rotating log file that automatically rotates when reaching a maximum size.
///
/// The log rotation process preserves the last full log file with a ".old" extension
/// while continuing to write to a new log file with the original name.
pub struct RotatingLog {
    /// Channel for sending data to the background writer
    tx: UnboundedSender<Vec<u8>>,

    /// Path to the current log file
    path: PathBuf,

    /// Background writer task handle
    _background_task: JoinHandle<()>,
}

/// A sync writer that sends all written data to a channel.
pub struct SyncChannelWriter {
    tx: UnboundedSender<Vec<u8>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RotatingLog {
    /// Creates a new rotating log file with the default maximum size.
    ///
    /// ## Errors
    ///
    /// Will return an error if the file cannot be created or opened, or if its
    /// metadata cannot be read.
    pub async fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::with_max_size(path, DEFAULT_LOG_MAX_SIZE).await
    }

    /// Creates a new rotating log file that rotates when `max_size` bytes is exceeded.
    pub async fn with_max_size(path: impl AsRef<Path>, max_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let current_size = file.metadata().await?.len();

        let (tx, rx) = mpsc::unbounded_channel();
        let background_task =
            tokio::spawn(Self::writer_loop(file, path.clone(), max_size, current_size, rx));

        Ok(Self {
            tx,
            path,
            _background_task: background_task,
        })
    }

    /// Returns the path of the current log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a synchronous writer that forwards all data to the background writer.
    pub fn get_sync_writer(&self) -> SyncChannelWriter {
        SyncChannelWriter {
            tx: self.tx.clone(),
        }
    }

    async fn writer_loop(
        mut file: tokio::fs::File,
        path: PathBuf,
        max_size: u64,
        mut current_size: u64,
        mut rx: UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(data) = rx.recv().await {
            if current_size + data.len() as u64 > max_size {
                match Self::rotate(&mut file, &path).await {
                    Ok(new_file) => {
                        file = new_file;
                        current_size = 0;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to rotate log file");
                    }
                }
            }

            if let Err(e) = file.write_all(&data).await {
                tracing::error!(path = %path.display(), error = %e, "failed to write to log file");
                continue;
            }
            if let Err(e) = file.flush().await {
                tracing::error!(path = %path.display(), error = %e, "failed to flush log file");
            }
            current_size += data.len() as u64;
        }
    }

    /// Rotates the current log file out to `.old` and opens a fresh one in its place.
    async fn rotate(file: &mut tokio::fs::File, path: &Path) -> io::Result<tokio::fs::File> {
        file.flush().await?;

        let backup_path = path.with_extension(format!(
            "{}.{}",
            path.extension().and_then(|e| e.to_str()).unwrap_or(""),
            ROTATED_LOG_EXTENSION
        ));
        rename(path, &backup_path).await?;

        OpenOptions::new().create(true).append(true).open(path).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Write for SyncChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log writer task is gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Data is flushed by the background writer after every chunk.
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    #[test_log::test(tokio::test)]
    async fn test_rotating_log_writes_through_sync_writer() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let log_path = temp_dir.path().join("proc.log");

        let log = RotatingLog::new(&log_path).await?;
        let mut writer = log.get_sync_writer();
        writer.write_all(b"hello from the pump\n")?;
        writer.flush()?;

        // Give the background writer a moment to drain the channel.
        sleep(Duration::from_millis(50)).await;

        let contents = tokio::fs::read_to_string(&log_path).await?;
        assert_eq!(contents, "hello from the pump\n");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rotating_log_rotates_at_max_size() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let log_path = temp_dir.path().join("proc.log");

        let log = RotatingLog::with_max_size(&log_path, 8).await?;
        let mut writer = log.get_sync_writer();
        writer.write_all(b"12345678")?;
        writer.write_all(b"abcd")?;

        sleep(Duration::from_millis(50)).await;

        let rotated = log_path.with_extension("log.old");
        assert!(rotated.exists());
        let contents = tokio::fs::read_to_string(&log_path).await?;
        assert_eq!(contents, "abcd");
        Ok(())
    }
}
