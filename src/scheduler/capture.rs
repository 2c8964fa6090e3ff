//! Bounded capture of a child's output pipes.
//!
//! Bytes go straight to the archive file until the size limit would be
//! passed. From then on only the most recent `limit` bytes are kept, in
//! memory, and the file is emptied; [`CappedOutput::finish`] writes that tail
//! back. The file on disk never holds more than `limit` bytes while the
//! command runs.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::PathBuf;

use log::debug;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::archive::StagingError;
use crate::constants::PIPE_CHUNK_SIZE;

pub(crate) struct CappedOutput {
    file: File,
    /// Full path of `file`, for error reports and read-back
    path: PathBuf,
    limit: Option<u64>,
    written: u64,
    tail: Option<VecDeque<u8>>,
}

impl CappedOutput {
    pub(crate) fn new(file: std::fs::File, path: PathBuf, limit: Option<u64>) -> Self {
        Self {
            file: File::from_std(file),
            path,
            limit,
            written: 0,
            tail: None,
        }
    }

    fn io_error(&self, source: io::Error) -> StagingError {
        StagingError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub(crate) async fn write(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        if let (Some(tail), Some(limit)) = (self.tail.as_mut(), self.limit) {
            push_tail(tail, chunk, limit);
            return Ok(());
        }

        match self.limit {
            Some(limit) if self.written + chunk.len() as u64 > limit => self.spill(chunk, limit).await,
            _ => {
                if let Err(e) = self.file.write_all(chunk).await {
                    return Err(self.io_error(e));
                }
                self.written += chunk.len() as u64;
                Ok(())
            }
        }
    }

    /// Move what is on disk into the in-memory tail and empty the file.
    async fn spill(&mut self, chunk: &[u8], limit: u64) -> Result<(), StagingError> {
        if let Err(e) = self.file.flush().await {
            return Err(self.io_error(e));
        }
        let head = match tokio::fs::read(&self.path).await {
            Ok(head) => head,
            Err(e) => return Err(self.io_error(e)),
        };

        let mut tail = VecDeque::with_capacity(head.len() + chunk.len());
        push_tail(&mut tail, &head, limit);
        push_tail(&mut tail, chunk, limit);
        self.empty_file().await?;

        debug!("{} passed {} bytes, keeping its tail", self.path.display(), limit);
        self.tail = Some(tail);
        Ok(())
    }

    async fn empty_file(&mut self) -> Result<(), StagingError> {
        let emptied = async {
            self.file.flush().await?;
            self.file.set_len(0).await?;
            self.file.seek(SeekFrom::Start(0)).await.map(|_| ())
        }
        .await;
        emptied.map_err(|e| self.io_error(e))
    }

    /// Drop everything captured so far.
    pub(crate) async fn reset(&mut self) -> Result<(), StagingError> {
        self.empty_file().await?;
        self.written = 0;
        self.tail = None;
        Ok(())
    }

    /// Write back a kept tail and flush. Returns whether output was cut.
    pub(crate) async fn finish(mut self) -> Result<bool, StagingError> {
        let tail = self.tail.take();
        let finished = async {
            if let Some(tail) = &tail {
                let (front, back) = tail.as_slices();
                self.file.write_all(front).await?;
                self.file.write_all(back).await?;
            }
            self.file.flush().await
        }
        .await;
        finished.map_err(|e| self.io_error(e))?;
        Ok(tail.is_some())
    }
}

/// Append `chunk`, then drop from the front until at most `limit` bytes remain.
fn push_tail(tail: &mut VecDeque<u8>, chunk: &[u8], limit: u64) {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let chunk = &chunk[chunk.len().saturating_sub(limit)..];
    let overflow = (tail.len() + chunk.len()).saturating_sub(limit);
    tail.drain(..overflow);
    tail.extend(chunk);
}

/// Copy a pipe into `sink` until end of stream. A read error ends the copy;
/// only a failing write is reported.
pub(crate) async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, sink: &Mutex<CappedOutput>) -> Result<(), StagingError> {
    let mut reader = match reader {
        Some(reader) => reader,
        None => return Ok(()),
    };

    let mut buffer = vec![0u8; PIPE_CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Output pipe read failed: {}", e);
                return Ok(());
            }
        };
        sink.lock().await.write(&buffer[..read]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn output(dir: &TempDir, limit: Option<u64>) -> (PathBuf, CappedOutput) {
        let path = dir.path().join("out");
        let file = std::fs::File::create(&path).unwrap();
        (path.clone(), CappedOutput::new(file, path, limit))
    }

    #[test]
    fn test_push_tail_keeps_last_bytes() {
        let mut tail = VecDeque::new();
        push_tail(&mut tail, b"abc", 4);
        push_tail(&mut tail, b"defgh", 4);
        assert_eq!(tail.iter().copied().collect::<Vec<u8>>(), b"efgh");

        push_tail(&mut tail, b"i", 4);
        assert_eq!(tail.iter().copied().collect::<Vec<u8>>(), b"fghi");
    }

    #[tokio::test]
    async fn test_under_limit_is_written_through() {
        let dir = TempDir::new().unwrap();
        let (path, mut out) = output(&dir, Some(10));
        out.write(b"hello").await.unwrap();
        assert!(!out.finish().await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_file_stays_within_limit_while_writing() {
        let dir = TempDir::new().unwrap();
        let (path, mut out) = output(&dir, Some(4));
        out.write(b"012").await.unwrap();
        out.write(b"3456").await.unwrap();
        out.write(b"789").await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() <= 4);

        assert!(out.finish().await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"6789");
    }

    #[tokio::test]
    async fn test_reset_discards_tail() {
        let dir = TempDir::new().unwrap();
        let (path, mut out) = output(&dir, Some(2));
        out.write(b"first run").await.unwrap();
        out.reset().await.unwrap();
        out.write(b"ok").await.unwrap();
        assert!(!out.finish().await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_pump_drains_reader() {
        let dir = TempDir::new().unwrap();
        let (path, out) = output(&dir, None);
        let sink = Mutex::new(out);
        pump(Some(&b"line one\nline two\n"[..]), &sink).await.unwrap();
        sink.into_inner().finish().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"line one\nline two\n");
    }
}
