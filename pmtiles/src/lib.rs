//! A reader for [PMTiles v3][format] archives.
//!
//! A PMTiles archive packs many small (usually compressed) map tiles into a
//! single file addressed by `(z, x, y)`. The index is a fixed 127-byte
//! [`Header`], a root [`Directory`] and an optional tier of leaf directories.
//! Tiles are located by mapping their coordinates onto a Hilbert curve.
//!
//! The archive may live in a local file or behind an HTTP endpoint supporting
//! range requests, see [`source`]. The high-level entry point is [`Archive`].
//!
//! [format]: https://github.com/protomaps/PMTiles/blob/main/spec/v3/spec.md
#[cfg(feature = "log")]
#[macro_use(trace_time)]
extern crate measure_time;

#[cfg(feature = "log")]
#[macro_use(trace, debug)]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
mod macros {
    macro_rules! trace {
        ($($tt:tt)*) => {
            let _ = if false {
                let _ = ::std::format_args!($($tt)*);
            };
        };
    }

    macro_rules! debug {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }

    macro_rules! trace_time {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }
}

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod archive;
pub mod cache;
pub mod compress;
pub mod directory;
pub mod error;
pub mod header;
pub mod hilbert;
pub mod source;
pub mod varint;

pub use positioned_io;

/// The only PMTiles format version this library supports.
pub const PMTILES_VERSION: u8 = 3;

pub use archive::{Archive, Bounds, Config, LngLat};
pub use directory::{Directory, Entry};
pub use error::{Error, ErrorKind, Result};
pub use header::{Compression, Header, TileType};
pub use source::{LocalSource, Source};

#[cfg(feature = "http")]
pub use source::HttpSource;

/// Well-known keys of the JSON metadata object, see [`Archive::metadata`].
pub mod metadata_keys {
    pub const VECTOR_LAYERS: &str = "vector_layers";
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const ATTRIBUTION: &str = "attribution";
    pub const TYPE: &str = "type";
    pub const VERSION: &str = "version";

    /// Value of [`TYPE`] for overlay layers.
    pub const TYPE_OVERLAY: &str = "overlay";
    /// Value of [`TYPE`] for base layers.
    pub const TYPE_BASELAYER: &str = "baselayer";
}
