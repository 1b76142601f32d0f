//! Random access byte sources an archive can be read from.
//!
//! A [`Source`] reads an exact number of bytes at an absolute offset or fails.
//! [`LocalSource`] wraps anything implementing [`positioned_io::ReadAt`],
//! typically a [`std::fs::File`] or an in-memory `Vec<u8>`. [`HttpSource`]
//! issues one HTTP range request per read and detects modifications of the
//! remote resource through its entity tag.
use std::{fmt, sync::Arc};

use parking_lot::RwLock;
use positioned_io::ReadAt;

use crate::error::{ErrorInner, Result};

/// A read-only, random access byte source.
///
/// Implementations must be safe to read from multiple threads concurrently.
pub trait Source: Send + Sync {
    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// A short read is an error, partially filled buffers are never reported
    /// as success. A source that detects it has been modified since a
    /// previous read fails with [`ErrorKind::SourceChanged`][crate::ErrorKind::SourceChanged].
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Expect the given version on subsequent reads, as reported by the `got` side
    /// of an [`ErrorKind::SourceChanged`][crate::ErrorKind::SourceChanged]
    /// error. Reads observing any other version keep failing.
    ///
    /// An [`Archive`][crate::Archive] calls this while re-synchronizing, with
    /// no other reads of its own in flight, and calls it again with the
    /// previous version if the reload fails.
    fn set_version(&self, _version: &str) {}

    /// Release underlying resources. Reads after closing fail.
    /// Closing twice is a no-op.
    fn close(&self) {}
}

impl<S: Source + ?Sized> Source for &S {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn set_version(&self, version: &str) {
        (**self).set_version(version);
    }

    fn close(&self) {
        (**self).close();
    }
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn set_version(&self, version: &str) {
        (**self).set_version(version);
    }

    fn close(&self) {
        (**self).close();
    }
}

impl<S: Source + ?Sized> Source for Arc<S> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn set_version(&self, version: &str) {
        (**self).set_version(version);
    }

    fn close(&self) {
        (**self).close();
    }
}

/// A local source over a [`ReadAt`] implementation.
///
/// You do NOT need additional buffering: reads are few and exactly sized.
pub struct LocalSource<R> {
    rdr: RwLock<Option<R>>,
}

impl<R: fmt::Debug> fmt::Debug for LocalSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSource")
            .field("rdr", &*self.rdr.read())
            .finish()
    }
}

impl<R> LocalSource<R> {
    pub fn new(rdr: R) -> Self {
        Self {
            rdr: RwLock::new(Some(rdr)),
        }
    }

    /// Retrieve the underlying reader, or `None` if the source was closed.
    pub fn into_inner(self) -> Option<R> {
        self.rdr.into_inner()
    }
}

impl LocalSource<std::fs::File> {
    /// Open a local file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(std::fs::File::open(path)?))
    }
}

impl<R: ReadAt + Send + Sync> Source for LocalSource<R> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let rdr = self.rdr.read();
        let rdr = rdr.as_ref().ok_or(ErrorInner::Closed)?;
        rdr.read_exact_at(offset, buf)?;
        Ok(())
    }

    fn close(&self) {
        *self.rdr.write() = None;
    }
}

#[cfg(feature = "http")]
pub use self::http::HttpSource;

#[cfg(feature = "http")]
mod http {
    use std::{
        io::Read,
        sync::atomic::{AtomicBool, Ordering},
    };

    use parking_lot::Mutex;

    use super::Source;
    use crate::error::{Error, ErrorInner, Result};

    const ETAG: &str = "ETag";
    const RANGE: &str = "Range";

    /// A remote source reading through HTTP range requests.
    ///
    /// Every read issues a fresh `GET` with `Range: bytes=<start>-<end>`.
    /// Redirects are followed. The first `ETag` seen is remembered, and any
    /// later response carrying a different one fails the read with
    /// [`ErrorKind::SourceChanged`][crate::ErrorKind::SourceChanged] before
    /// its body is consumed.
    ///
    /// Timeouts and other transport policies are those of the [`ureq::Agent`],
    /// see [`HttpSource::with_agent`].
    #[derive(Debug)]
    pub struct HttpSource {
        agent: ureq::Agent,
        url: String,
        etag: Mutex<Option<String>>,
        closed: AtomicBool,
    }

    impl HttpSource {
        /// Create a source for `url` with a default agent.
        pub fn new(url: impl Into<String>) -> Self {
            let agent = ureq::AgentBuilder::new()
                .redirects(5)
                .max_idle_connections(0)
                .build();
            Self::with_agent(agent, url)
        }

        /// Create a source for `url` using a custom agent.
        pub fn with_agent(agent: ureq::Agent, url: impl Into<String>) -> Self {
            Self {
                agent,
                url: url.into(),
                etag: Mutex::new(None),
                closed: AtomicBool::new(false),
            }
        }

        #[must_use]
        pub fn url(&self) -> &str {
            &self.url
        }

        /// The entity tag captured from the first response, if any.
        #[must_use]
        pub fn etag(&self) -> Option<String> {
            self.etag.lock().clone()
        }

        fn check_etag(&self, got: Option<&str>) -> Result<()> {
            let Some(got) = got else {
                return Ok(());
            };
            // Compare and store under one lock, so concurrent first reads agree.
            let mut saved = self.etag.lock();
            match &*saved {
                Some(expect) if expect != got => Err(Error::source_changed(expect.clone(), got)),
                Some(_) => Ok(()),
                None => {
                    trace!("{}: captured entity tag {got:?}", self.url);
                    *saved = Some(got.to_owned());
                    Ok(())
                }
            }
        }
    }

    impl Source for HttpSource {
        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                bail!(ErrorInner::Closed);
            }
            if buf.is_empty() {
                return Ok(());
            }
            let end = offset
                .checked_add(buf.len() as u64 - 1)
                .ok_or(ErrorInner::Validation("read range overflow"))?;
            let range = format!("bytes={offset}-{end}");
            trace!("{}: GET {range}", self.url);

            let resp = match self.agent.get(&self.url).set(RANGE, &range).call() {
                Ok(resp) => resp,
                Err(ureq::Error::Status(code, _)) => {
                    bail!(std::io::Error::other(format!(
                        "unexpected HTTP status {code} for {range}"
                    )))
                }
                Err(err) => bail!(std::io::Error::other(err.to_string())),
            };
            if !matches!(resp.status(), 200 | 206) {
                bail!(std::io::Error::other(format!(
                    "unexpected HTTP status {} for {range}",
                    resp.status()
                )));
            }
            if resp.status() == 200 && offset != 0 {
                bail!(std::io::Error::other(format!(
                    "server ignored range request {range}"
                )));
            }

            self.check_etag(resp.header(ETAG))?;

            resp.into_reader().read_exact(buf)?;
            Ok(())
        }

        fn set_version(&self, version: &str) {
            trace!("{}: expecting entity tag {version:?}", self.url);
            *self.etag.lock() = Some(version.to_owned());
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }
}
