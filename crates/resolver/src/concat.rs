//! Transitional "concat" object holding a module's manifest and archive.
//!
//! Layout:
//!
//! ```text
//! varint(commit time, unix seconds) || uvarint(len(manifest)) || manifest || archive
//! ```
//!
//! Both integers are 64-bit LEB128 varints, the signed one zig-zag encoded.
//! The manifest length delimits the two payloads; either may be empty.

use crate::DataStream;
use crate::shared_file::SharedFile;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::io::{self, Read, Seek, SeekFrom};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;

/// Longest encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Bytes read up front when parsing: room for both varints.
pub const HEADER_BUFFER_LEN: usize = MAX_VARINT_LEN * 2;

#[derive(Debug, Error)]
pub enum ConcatError {
    #[error("data does not start with a valid 64-bit varint")]
    InvalidCommitTime,

    #[error("data does not start with two valid 64-bit varints")]
    InvalidManifestLength,

    #[error("manifest length {0} is too large")]
    ManifestTooLarge(u64),

    #[error("commit time {0} is out of range")]
    CommitTimeOutOfRange(i64),

    #[error("manifest is truncated: expected {expected} more bytes")]
    TruncatedManifest { expected: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Append the zig-zag varint encoding of `v`.
pub fn put_varint(buf: &mut Vec<u8>, v: i64) {
    let zigzag = ((v << 1) ^ (v >> 63)) as u64;
    put_uvarint(buf, zigzag);
}

/// Append the unsigned varint encoding of `v`.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decode an unsigned varint. Returns the value and bytes consumed, or None
/// if the input is truncated or overflows 64 bits.
pub fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return None;
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return None;
            }
            return Some((x | (u64::from(b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    None
}

/// Decode a zig-zag varint.
pub fn read_varint(buf: &[u8]) -> Option<(i64, usize)> {
    let (ux, n) = read_uvarint(buf)?;
    let mut x = (ux >> 1) as i64;
    if ux & 1 != 0 {
        x = !x;
    }
    Some((x, n))
}

enum Phase {
    Header,
    Manifest,
    Archive,
}

/// Streams a concat object built from the two files produced by the
/// toolchain, without buffering either of them.
///
/// Only `SeekFrom::Start(0)` is supported, which rewinds both files so the
/// upload can be retried. The manifest size is sampled once at construction;
/// the files must not change while the encoder is in use.
pub struct ConcatEncoder {
    header: Vec<u8>,
    header_pos: usize,
    manifest: SharedFile,
    archive: SharedFile,
    phase: Phase,
}

impl ConcatEncoder {
    pub fn new(
        commit_time: OffsetDateTime,
        manifest: SharedFile,
        archive: SharedFile,
    ) -> io::Result<Self> {
        let mut header = Vec::with_capacity(HEADER_BUFFER_LEN);
        put_varint(&mut header, commit_time.unix_timestamp());
        put_uvarint(&mut header, manifest.len()?);
        Ok(Self {
            header,
            header_pos: 0,
            manifest,
            archive,
            phase: Phase::Header,
        })
    }
}

impl Read for ConcatEncoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.phase {
                Phase::Header => {
                    let rest = &self.header[self.header_pos..];
                    if rest.is_empty() {
                        self.phase = Phase::Manifest;
                        continue;
                    }
                    let n = rest.len().min(buf.len());
                    buf[..n].copy_from_slice(&rest[..n]);
                    self.header_pos += n;
                    return Ok(n);
                }
                Phase::Manifest => {
                    let n = self.manifest.read(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                    self.phase = Phase::Archive;
                }
                Phase::Archive => return self.archive.read(buf),
            }
        }
    }
}

impl Seek for ConcatEncoder {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if pos != SeekFrom::Start(0) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("only seeking to the start is supported, got {pos:?}"),
            ));
        }
        self.manifest.rewind()?;
        self.archive.rewind()?;
        self.header_pos = 0;
        self.phase = Phase::Header;
        Ok(0)
    }
}

/// The decoded front of a concat object.
#[derive(Clone, Debug, PartialEq)]
pub struct ConcatHeader {
    pub commit_time: OffsetDateTime,
    /// Manifest bytes that arrived with the header buffer.
    pub manifest_prefix: Bytes,
    /// Manifest bytes still to be read from the stream.
    pub manifest_remaining: u64,
    /// Archive bytes that arrived with the header buffer.
    pub archive_prefix: Bytes,
}

/// Read the fixed-size header buffer and decode both varints.
///
/// The buffer is filled until it is full or the stream ends, so short reads
/// from the underlying stream do not matter.
pub async fn parse_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ConcatHeader, ConcatError> {
    let mut buffer = [0u8; HEADER_BUFFER_LEN];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let data = &buffer[..filled];

    let (unix, n1) = read_varint(data).ok_or(ConcatError::InvalidCommitTime)?;
    let commit_time = OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|_| ConcatError::CommitTimeOutOfRange(unix))?;
    let (manifest_len, n2) =
        read_uvarint(&data[n1..]).ok_or(ConcatError::InvalidManifestLength)?;
    if manifest_len > i64::MAX as u64 {
        return Err(ConcatError::ManifestTooLarge(manifest_len));
    }

    let rest = &data[n1 + n2..];
    let header = match usize::try_from(manifest_len) {
        Ok(len) if len <= rest.len() => ConcatHeader {
            commit_time,
            manifest_prefix: Bytes::copy_from_slice(&rest[..len]),
            manifest_remaining: 0,
            archive_prefix: Bytes::copy_from_slice(&rest[len..]),
        },
        _ => ConcatHeader {
            commit_time,
            manifest_prefix: Bytes::copy_from_slice(rest),
            manifest_remaining: manifest_len - rest.len() as u64,
            archive_prefix: Bytes::new(),
        },
    };
    Ok(header)
}

/// Read the rest of the manifest after [`parse_header`].
pub async fn read_manifest<R: AsyncRead + Unpin>(
    header: &ConcatHeader,
    reader: &mut R,
) -> Result<Bytes, ConcatError> {
    let remaining = header.manifest_remaining;
    let mut manifest = BytesMut::from(&header.manifest_prefix[..]);
    let mut rest = Vec::new();
    let n = (&mut *reader).take(remaining).read_to_end(&mut rest).await?;
    if (n as u64) < remaining {
        return Err(ConcatError::TruncatedManifest {
            expected: remaining - n as u64,
        });
    }
    manifest.extend_from_slice(&rest);
    Ok(manifest.freeze())
}

/// Stream the manifest after [`parse_header`] without touching the archive.
///
/// A stream that ends early yields an `UnexpectedEof` error as its last item.
pub fn manifest_stream<R>(header: ConcatHeader, reader: R) -> DataStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let remaining = header.manifest_remaining;
    let prefix = header.manifest_prefix;
    Box::pin(async_stream::try_stream! {
        if !prefix.is_empty() {
            yield prefix;
        }
        if remaining > 0 {
            let mut tail = ReaderStream::new(reader.take(remaining));
            let mut read = 0u64;
            while let Some(chunk) = tail.next().await {
                let chunk = chunk?;
                read += chunk.len() as u64;
                yield chunk;
            }
            if read < remaining {
                Err::<(), io::Error>(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    ConcatError::TruncatedManifest {
                        expected: remaining - read,
                    },
                ))?;
            }
        }
    })
}

/// Stream the archive after [`parse_header`], skipping any unread manifest bytes.
pub async fn archive_stream<R>(header: ConcatHeader, mut reader: R) -> Result<DataStream, ConcatError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    if header.manifest_remaining > 0 {
        let skipped = tokio::io::copy(
            &mut (&mut reader).take(header.manifest_remaining),
            &mut tokio::io::sink(),
        )
        .await?;
        if skipped < header.manifest_remaining {
            return Err(ConcatError::TruncatedManifest {
                expected: header.manifest_remaining - skipped,
            });
        }
    }
    let prefix = header.archive_prefix;
    let head = futures::stream::iter((!prefix.is_empty()).then_some(Ok(prefix)));
    Ok(Box::pin(head.chain(ReaderStream::new(reader))))
}
