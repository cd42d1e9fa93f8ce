use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Upper bound on one serialised record frame. Anything larger is a
/// corrupt file, not data.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Writes scanned rows into a uniquely-named temp file as length-prefixed
/// record frames, then seals it into a [`SnapshotDump`].
///
/// Dropping an unfinished writer removes the partial file.
pub struct DumpWriter {
    file: Option<BufWriter<File>>,
    path: PathBuf,
}

impl DumpWriter {
    /// Creates `<uuid>.dump` in the server's working directory.
    pub async fn create() -> Result<Self> {
        Self::create_in(Path::new(".")).await
    }

    pub async fn create_in(dir: &Path) -> Result<Self> {
        let path = dir.join(format!("{}.dump", Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
            path,
        })
    }

    pub async fn push(&mut self, record: &[String]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(already_finished());
        };
        let frame = serde_json::to_vec(record)?;
        file.write_all(&(frame.len() as u32).to_le_bytes()).await?;
        file.write_all(&frame).await?;
        Ok(())
    }

    /// Flushes, rewinds and converts into the read-side iterator.
    pub async fn finish(mut self) -> Result<SnapshotDump> {
        let Some(mut file) = self.file.take() else {
            return Err(already_finished());
        };
        file.flush().await?;
        let mut file = file.into_inner();
        file.rewind().await?;
        Ok(SnapshotDump {
            reader: Some(BufReader::new(file)),
            path: std::mem::take(&mut self.path),
            pending: None,
        })
    }
}

impl Drop for DumpWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn already_finished() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "dump writer already finished",
    ))
}

/// Single-pass forward iterator over a materialised snapshot.
///
/// The backing file is deleted on [`close`](Self::close) and, as a
/// fallback, on drop.
pub struct SnapshotDump {
    reader: Option<BufReader<File>>,
    path: PathBuf,
    pending: Option<Vec<String>>,
}

impl SnapshotDump {
    /// Returns the next record, or `None` once the dump is exhausted.
    pub async fn next(&mut self) -> Result<Option<Vec<String>>> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::CorruptDump("truncated record frame"));
            }
            filled += n;
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_SIZE {
            return Err(Error::CorruptDump("oversized record frame"));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        Ok(Some(serde_json::from_slice(&frame)?))
    }

    /// Returns a record obtained from [`next`](Self::next) so the
    /// following call yields it again. Holds at most one record.
    pub fn push_back(&mut self, record: Vec<String>) {
        self.pending = Some(record);
    }

    /// Deletes the backing file. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.reader.take().is_some() {
            tokio::fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

impl Drop for SnapshotDump {
    fn drop(&mut self) {
        if self.reader.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
