use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use tokio::fs::File;

/// A read-only memory mapping of an immutable file. The mapping lives as
/// long as the value; dropping it closes the file.
#[derive(Debug)]
pub struct MmapFile {
    f: File,
    len: usize,
    mmap: Mmap,
}

impl MmapFile {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = File::open(path).await?;

        let meta = f.metadata().await?;
        let len = meta.len() as usize;

        let mmap = unsafe { MmapOptions::new().offset(0).len(len).map(&f)? };

        Ok(Self { f, len, mmap })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Bounds-checked view of a byte range.
    pub fn slice(&self, offset: usize, size: usize) -> io::Result<&[u8]> {
        let upper = offset
            .checked_add(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "range overflow"))?;
        if upper > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "range past end of mapping",
            ));
        }
        Ok(&self.mmap[offset..upper])
    }

    pub async fn close(self) -> io::Result<()> {
        drop(self.mmap);
        drop(self.f);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::fs::File;
    use tokio::io;
    use tokio::io::AsyncWriteExt;

    use crate::mmap::MmapFile;

    #[tokio::test]
    async fn test_mmap_file() -> io::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("mmap_test");

        let data = "0123456789".as_bytes();
        {
            let mut f = File::create(&path).await?;
            f.write_all(data).await?;
            f.sync_all().await?;
        }

        let m = MmapFile::open(&path).await?;
        assert_eq!(m.len(), data.len());
        assert_eq!(m.as_slice(), data);
        assert_eq!(m.slice(3, 4)?, b"3456");
        assert!(m.slice(8, 4).is_err());

        m.close().await?;
        Ok(())
    }
}
