use std::io;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Suffix for files still being written. A crash leaves them behind; open
/// paths ignore and remove them.
pub const TMP_FILE_SUFFIX: &str = ".tmp";

/// How many bytes may accumulate before an automatic fsync.
const FSYNC_EVERY: u64 = 25 * 1024 * 1024;

/// An append-only file writer tracking its write position and syncing to
/// disk every `FSYNC_EVERY` bytes.
pub struct FileWriter {
    f: File,
    pos: u64,
    last_sync: u64,
}

impl FileWriter {
    /// Creates the file. Fails if it already exists.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = OpenOptions::new()
            .create_new(true)
            .write(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            f,
            pos: 0,
            last_sync: 0,
        })
    }

    /// Opens an existing file for appending, positioned at its current end.
    pub async fn append(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = OpenOptions::new().write(true).append(true).open(path).await?;

        let pos = f.metadata().await?.len();
        Ok(Self {
            f,
            pos,
            last_sync: pos,
        })
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.f.write_all(data).await?;
        self.pos += data.len() as u64;

        if self.pos - self.last_sync >= FSYNC_EVERY {
            self.f.flush().await?;
            self.f.sync_data().await?;
            self.last_sync = self.pos;
        }

        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.f.flush().await
    }

    pub async fn sync(&mut self) -> io::Result<()> {
        self.f.flush().await?;
        self.f.sync_all().await?;
        self.last_sync = self.pos;
        Ok(())
    }

    /// Truncates the file to `len` bytes. Used by recovery to drop a torn
    /// tail before appending resumes.
    pub async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.f.flush().await?;
        self.f.set_len(len).await?;
        self.pos = len;
        self.last_sync = self.last_sync.min(len);
        Ok(())
    }
}

/// Fsyncs a directory so a rename inside it survives a crash.
pub async fn sync_dir(dir: impl AsRef<Path>) -> io::Result<()> {
    let f = File::open(dir).await?;
    f.sync_all().await
}

/// Atomically installs `tmp` at `dst`: rename, then fsync the parent
/// directory.
pub async fn install_file(tmp: impl AsRef<Path>, dst: impl AsRef<Path>) -> io::Result<()> {
    tokio::fs::rename(tmp.as_ref(), dst.as_ref()).await?;

    if let Some(parent) = dst.as_ref().parent() {
        sync_dir(parent).await?;
    }
    Ok(())
}
