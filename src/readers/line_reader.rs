//! Tailing line reader with rotation detection.

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use bstr::ByteSlice;
use bytes::{Buf, Bytes, BytesMut};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

use super::Cursor;

/// Backwards scan step used when looking for the last line boundary.
const TAIL_SCAN_STEP: u64 = 16;

#[derive(Debug, Snafu)]
pub enum ReadError {
    #[snafu(display("I/O failure on '{}': {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("log file '{}' is not acquired", path.display()))]
    NotAcquired { path: PathBuf },
}

/// Reads newline-delimited lines from one file, transparently reopening the
/// path when the file under it is rotated.
///
/// The reader keeps a [`Cursor`] that always points at the byte following
/// the last line it handed out, so persisting the cursor at any instant
/// never runs ahead of emitted output.
pub struct LineReader {
    path: PathBuf,
    file: Option<File>,
    buf: BytesMut,
    buffer_size: usize,
    cursor: Cursor,
    from_tail: bool,
}

impl LineReader {
    /// Opens `path` for tailing.
    ///
    /// `initial_cursor` is honored only when its `(inode, device)` pair still
    /// matches the file at `path`; otherwise reading starts at the beginning,
    /// or at the last line boundary when `from_tail` is set.
    pub async fn new(
        path: impl Into<PathBuf>,
        buffer_size: usize,
        initial_cursor: Cursor,
        from_tail: bool,
    ) -> Result<Self, ReadError> {
        let path = path.into();
        let (inode, device) = stat(&path).await?;

        let mut reader = Self {
            cursor: Cursor {
                inode,
                device,
                offset: 0,
            },
            path,
            file: None,
            buf: BytesMut::new(),
            buffer_size,
            from_tail,
        };

        let cursor_valid = initial_cursor.same_file(inode, device);

        if cursor_valid {
            reader.cursor = initial_cursor;
        }

        reader.acquire(!cursor_valid).await?;
        Ok(reader)
    }

    /// Reads one line, cutting off the trailing newline.
    ///
    /// Returns `Ok(None)` when no complete record is currently available
    /// (the "no records" sentinel). A line that exceeds the reader buffer is
    /// handed out in buffer-sized chunks with the prefix flag set on all but
    /// the last. At end of file the path is re-stat'ed: an unchanged
    /// identity yields the sentinel, a changed identity resets the cursor to
    /// the new file's start, reopens it, and yields the sentinel for this
    /// iteration.
    pub async fn entry_read(&mut self) -> Result<Option<(Bytes, bool)>, ReadError> {
        loop {
            // A delimiter within the buffer window ends an ordinary line; a
            // line of exactly the buffer size stays unflagged.
            if let Some(index) = self.buf.find_byte(b'\n') {
                if index <= self.buffer_size {
                    let line = self.buf.split_to(index).freeze();
                    self.buf.advance(1);
                    self.cursor.offset += index as u64 + 1;
                    return Ok(Some((line, false)));
                }

                return Ok(Some((self.split_prefix_chunk(), true)));
            }

            if self.buf.len() > self.buffer_size {
                return Ok(Some((self.split_prefix_chunk(), true)));
            }

            let file = self.file.as_mut().context(NotAcquiredSnafu {
                path: self.path.clone(),
            })?;
            let read = file.read_buf(&mut self.buf).await.context(IoSnafu {
                path: self.path.clone(),
            })?;

            if read > 0 {
                continue;
            }

            // End of file with a dangling partial line: hand it out now, a
            // renamed-away file will never complete it.
            if !self.buf.is_empty() {
                let length = self.buf.len();
                let line = self.buf.split_to(length).freeze();
                self.cursor.offset += length as u64;
                return Ok(Some((line, false)));
            }

            return self.check_rotation().await;
        }
    }

    fn split_prefix_chunk(&mut self) -> Bytes {
        let chunk = self.buf.split_to(self.buffer_size).freeze();
        self.cursor.offset += self.buffer_size as u64;
        chunk
    }

    async fn check_rotation(&mut self) -> Result<Option<(Bytes, bool)>, ReadError> {
        let (inode, device) = match stat(&self.path).await {
            Ok(identity) => identity,
            Err(error) => {
                // The path is gone or unreadable; invalidate the in-memory
                // cursor so a later commit cannot resurrect a stale offset.
                self.cursor = Cursor::default();
                return Err(error);
            }
        };

        if self.cursor.same_file(inode, device) {
            return Ok(None);
        }

        self.cursor = Cursor {
            inode,
            device,
            offset: 0,
        };
        self.acquire(false).await?;
        Ok(None)
    }

    async fn acquire(&mut self, consider_tail: bool) -> Result<(), ReadError> {
        self.file = None;
        self.buf.clear();

        let mut file = File::open(&self.path).await.context(IoSnafu {
            path: self.path.clone(),
        })?;

        if consider_tail && self.from_tail {
            self.cursor.offset = last_line_boundary(&mut file).await;
        }

        let offset = file
            .seek(SeekFrom::Start(self.cursor.offset))
            .await
            .context(IoSnafu {
                path: self.path.clone(),
            })?;

        self.cursor.offset = offset;
        self.file = Some(file);
        Ok(())
    }

    /// Current in-memory cursor.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Whether the reader currently holds an open file.
    pub fn acquired(&self) -> bool {
        self.file.is_some()
    }

    /// Drops the file handle.
    pub fn close(&mut self) {
        self.file = None;
    }
}

async fn stat(path: &Path) -> Result<(u64, u64), ReadError> {
    use std::os::unix::fs::MetadataExt;

    let metadata = tokio::fs::metadata(path)
        .await
        .context(IoSnafu { path })?;
    Ok((metadata.ino(), metadata.dev()))
}

/// Returns the offset just past the last `'\n'`, scanning the file backwards
/// in small chunks. Returns zero when the file holds no newline or on I/O
/// errors.
async fn last_line_boundary(file: &mut File) -> u64 {
    let Ok(mut offset) = file.seek(SeekFrom::End(0)).await else {
        return 0;
    };
    let mut step = TAIL_SCAN_STEP;

    while offset > 0 {
        if offset < step {
            step = offset;
        }

        offset -= step;

        if file.seek(SeekFrom::Start(offset)).await.is_err() {
            return 0;
        }

        let mut buffer = vec![0u8; step as usize];

        if file.read_exact(&mut buffer).await.is_err() {
            return 0;
        }

        if let Some(position) = buffer.rfind_byte(b'\n') {
            return offset + position as u64 + 1;
        }
    }

    0
}
