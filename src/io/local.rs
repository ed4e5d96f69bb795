use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{ByteRange, ReadAt};
use crate::error::{ArchiveError, Result};

/// Local file reader with random access support
pub struct LocalFileReader {
    file: Arc<std::fs::File>,
    size: u64,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }
}

fn read_exact_at(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            done += n;
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes> {
        let Some((start, end)) = range.clamp(self.size) else {
            return Ok(Bytes::new());
        };

        let file = self.file.clone();
        let len = (end - start + 1) as usize;
        let read = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_exact_at(&file, start, &mut buf).map(|_| buf)
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
            res = read => {
                let buf = res.map_err(|e| ArchiveError::TransferFailure(e.to_string()))??;
                Ok(Bytes::from(buf))
            }
        }
    }

    fn size(&self) -> u64 {
        self.size
    }
}
