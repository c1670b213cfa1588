//! Buffered reader that digests every byte it pulls from the source.

use std::io::Read;

use crc32fast::Hasher;
use sha2::{Digest, Sha256};

use crate::error::{Result, TapeError};

const BUFFER_SIZE: usize = 65536;

/// CRC-32 and SHA-256 of an image file as read from disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageChecksums {
    pub crc32: u32,
    pub sha256: [u8; 32],
}

impl ImageChecksums {
    pub fn sha256_hex(&self) -> String {
        self.sha256.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Each refill hashes the whole refilled block before any of it is handed
/// out, so the digests cover the physical file bytes no matter how the
/// parser slices its reads.
pub struct ChecksumReader<R> {
    inner: R,
    buffer: Box<[u8]>,
    level: usize,
    cursor: usize,
    base: u64,
    crc: Hasher,
    sha: Sha256,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            level: 0,
            cursor: 0,
            base: 0,
            crc: Hasher::new(),
            sha: Sha256::new(),
        }
    }

    /// Stream position of the next unread byte.
    pub fn pos(&self) -> u64 {
        self.base + self.cursor as u64
    }

    fn refill(&mut self) -> Result<bool> {
        let actual = loop {
            match self.inner.read(&mut self.buffer) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if actual == 0 {
            return Ok(false);
        }

        self.base += self.cursor as u64;
        self.cursor = 0;
        self.level = actual;

        let block = &self.buffer[..actual];
        self.crc.update(block);
        self.sha.update(block);
        Ok(true)
    }

    /// Borrows up to `n` buffered bytes without copying. An empty slice means
    /// end of stream.
    pub fn lock_read(&mut self, n: usize) -> Result<&[u8]> {
        if self.cursor == self.level {
            self.refill()?;
        }

        let start = self.cursor;
        let len = (self.level - start).min(n);
        self.cursor += len;
        Ok(&self.buffer[start..start + len])
    }

    /// Reads as much of `buf` as the stream holds and returns the count.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = self.lock_read(buf.len() - done)?;
            if chunk.is_empty() {
                break;
            }

            let n = chunk.len();
            buf[done..done + n].copy_from_slice(chunk);
            done += n;
        }

        Ok(done)
    }

    /// Fills `buf` completely or fails with [`TapeError::UnexpectedEof`].
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let offset = self.pos();
        if self.read_data(buf)? != buf.len() {
            return Err(TapeError::UnexpectedEof {
                offset,
                wanted: buf.len(),
            });
        }

        Ok(())
    }

    /// Consumes `n` bytes, failing like [`Self::read_exact`] on a short stream.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        let offset = self.pos();
        let mut left = n;
        while left > 0 {
            let chunk = self.lock_read(left)?.len();
            if chunk == 0 {
                return Err(TapeError::UnexpectedEof { offset, wanted: n });
            }
            left -= chunk;
        }

        Ok(())
    }

    /// Digests of every byte pulled from the source so far.
    pub fn checksums(self) -> ImageChecksums {
        ImageChecksums {
            crc32: self.crc.finalize(),
            sha256: self.sha.finalize().into(),
        }
    }
}
