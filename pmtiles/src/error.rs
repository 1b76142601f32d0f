//! The error type shared by all modules of this crate.
use std::fmt;

use crate::header::Compression;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from reading or decoding a PMTiles archive.
///
/// Use [`Error::kind`] to classify it. A tile missing from the archive is
/// not an error, lookups return `Ok(None)` for it.
pub struct Error(Box<ErrorInner>);

/// The category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed or unsupported archive structure. Retrying will not help.
    Format,
    /// The underlying source failed or returned fewer bytes than requested.
    Io,
    /// The archive uses a compression method that is not available.
    UnsupportedCompression,
    /// The remote resource was modified between two reads.
    SourceChanged,
    /// A variable-length integer ran past the end of its buffer.
    TruncatedInput,
}

#[derive(Debug)]
pub(crate) enum ErrorInner {
    // Header.
    HeaderLength(usize),
    TruncatedHeader(Error),
    InvalidMagic([u8; 7]),
    UnsupportedVersion(u8),

    // Directory.
    TruncatedVarint,
    TooManyEntries(u64),
    EntryTooLarge(u64),
    BlockTooLarge { limit: usize, got: u64 },
    Validation(&'static str),

    // Payload.
    UnsupportedCompression(Compression),
    Decompress(std::io::Error),

    // Source.
    SourceChanged { expect: String, got: String },
    SourceChangedAgain(Error),
    Closed,
    Io(std::io::Error),

    Context(String, Error),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInner::HeaderLength(_)
            | ErrorInner::TruncatedHeader(_)
            | ErrorInner::InvalidMagic(_)
            | ErrorInner::UnsupportedVersion(_)
            | ErrorInner::TooManyEntries(_)
            | ErrorInner::EntryTooLarge(_)
            | ErrorInner::BlockTooLarge { .. }
            | ErrorInner::Validation(_)
            | ErrorInner::Decompress(_) => ErrorKind::Format,
            ErrorInner::TruncatedVarint => ErrorKind::TruncatedInput,
            ErrorInner::UnsupportedCompression(_) => ErrorKind::UnsupportedCompression,
            ErrorInner::SourceChanged { .. } => ErrorKind::SourceChanged,
            ErrorInner::SourceChangedAgain(_) | ErrorInner::Closed | ErrorInner::Io(_) => {
                ErrorKind::Io
            }
            ErrorInner::Context(_, err) => err.kind(),
        }
    }

    /// Shortcut for `self.kind() == ErrorKind::SourceChanged`.
    #[must_use]
    pub fn is_source_changed(&self) -> bool {
        self.kind() == ErrorKind::SourceChanged
    }

    /// The `(expect, got)` versions of a [`ErrorKind::SourceChanged`] error.
    pub(crate) fn changed_versions(&self) -> Option<(&str, &str)> {
        match &*self.0 {
            ErrorInner::SourceChanged { expect, got } => Some((expect, got)),
            ErrorInner::Context(_, err) => err.changed_versions(),
            _ => None,
        }
    }

    /// Whether the source ended before the requested range.
    pub(crate) fn is_unexpected_eof(&self) -> bool {
        match &*self.0 {
            ErrorInner::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            ErrorInner::Context(_, err) => err.is_unexpected_eof(),
            _ => false,
        }
    }

    #[cold]
    pub(crate) fn context(self, msg: impl fmt::Display) -> Self {
        ErrorInner::Context(msg.to_string(), self).into()
    }

    /// Build an error for an entity tag mismatch of a remote source.
    #[cold]
    pub fn source_changed(expect: impl Into<String>, got: impl Into<String>) -> Self {
        ErrorInner::SourceChanged {
            expect: expect.into(),
            got: got.into(),
        }
        .into()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::HeaderLength(len) => {
                write!(f, "invalid header length: expect 127 bytes, got {len}")
            }
            ErrorInner::TruncatedHeader(err) => {
                write!(f, "source is shorter than the 127-byte header: {err}")
            }
            ErrorInner::InvalidMagic(magic) => {
                write!(f, "invalid header magic: b\"{}\"", magic.escape_ascii())
            }
            ErrorInner::UnsupportedVersion(ver) => write!(f, "unsupported PMTiles version {ver}"),

            ErrorInner::TruncatedVarint => f.pad("unexpected end of input in varint"),
            ErrorInner::TooManyEntries(n) => write!(f, "directory has too many entries: {n}"),
            ErrorInner::EntryTooLarge(len) => {
                write!(f, "directory entry length {len} exceeds the limit")
            }
            ErrorInner::BlockTooLarge { limit, got } => {
                write!(
                    f,
                    "block has {got} bytes, exceeding the limit of {limit} bytes"
                )
            }
            ErrorInner::Validation(msg) => write!(f, "malformed archive: {msg}"),

            ErrorInner::UnsupportedCompression(c) => {
                write!(f, "unsupported compression method {c:?}")
            }
            ErrorInner::Decompress(err) => write!(f, "failed to decompress: {err}"),

            ErrorInner::SourceChanged { expect, got } => {
                write!(f, "source changed: entity tag {expect:?} became {got:?}")
            }
            ErrorInner::SourceChangedAgain(err) => {
                write!(f, "source changed again after re-synchronization: {err}")
            }
            ErrorInner::Closed => f.pad("source is closed"),
            ErrorInner::Io(err) => write!(f, "input/output error: {err}"),

            ErrorInner::Context(msg, err) => write!(f, "{msg}: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Decompress(err) | ErrorInner::Io(err) => Some(err),
            ErrorInner::TruncatedHeader(err)
            | ErrorInner::SourceChangedAgain(err)
            | ErrorInner::Context(_, err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}
