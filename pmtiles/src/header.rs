//! The fixed 127-byte archive header.
//!
//! All multi-byte fields are little-endian. Positions are stored as degrees
//! multiplied by 10^7, longitude first.
//!
//! See also:
//! [PMTiles Version 3 Specification](https://github.com/protomaps/PMTiles/blob/main/spec/v3/spec.md#3-header)
use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian as le};

use crate::error::{ErrorInner, Result};

/// The size of the header in bytes.
pub const HEADER_SIZE: usize = size_of::<Header>();

const _: () = assert!(HEADER_SIZE == 127);

/// The raw archive header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Header {
    /// Should match [`Header::MAGIC`].
    pub magic: [u8; 7],
    /// Should match [`crate::PMTILES_VERSION`].
    pub version: u8,
    /// Absolute offset of the root directory.
    pub root_dir_offset: le::U64,
    pub root_dir_length: le::U64,
    /// Absolute offset of the JSON metadata.
    pub metadata_offset: le::U64,
    pub metadata_length: le::U64,
    /// Absolute offset of the leaf directory section.
    pub leaf_dirs_offset: le::U64,
    pub leaf_dirs_length: le::U64,
    /// Absolute offset of the tile data section.
    pub tile_data_offset: le::U64,
    pub tile_data_length: le::U64,
    /// Number of tiles addressable by directory entries, counting runs. Informational.
    pub addressed_tiles: le::U64,
    /// Number of directory entries pointing to tile data. Informational.
    pub tile_entries: le::U64,
    /// Number of distinct tile contents. Informational.
    pub tile_contents: le::U64,
    /// 1 if tile data is ordered by tile id, 0 otherwise.
    pub clustered: u8,
    /// Compression of directories and metadata.
    pub internal_compression: Compression,
    pub tile_compression: Compression,
    pub tile_type: TileType,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub min_lon_e7: le::I32,
    pub min_lat_e7: le::I32,
    pub max_lon_e7: le::I32,
    pub max_lat_e7: le::I32,
    pub center_zoom: u8,
    pub center_lon_e7: le::I32,
    pub center_lat_e7: le::I32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("magic", &format_args!("b\"{}\"", self.magic.escape_ascii()))
            .field("version", &self.version)
            .field("root_dir", &(self.root_dir_offset.get(), self.root_dir_length.get()))
            .field("metadata", &(self.metadata_offset.get(), self.metadata_length.get()))
            .field("leaf_dirs", &(self.leaf_dirs_offset.get(), self.leaf_dirs_length.get()))
            .field("tile_data", &(self.tile_data_offset.get(), self.tile_data_length.get()))
            .field("addressed_tiles", &self.addressed_tiles.get())
            .field("tile_entries", &self.tile_entries.get())
            .field("tile_contents", &self.tile_contents.get())
            .field("clustered", &self.clustered)
            .field("internal_compression", &self.internal_compression)
            .field("tile_compression", &self.tile_compression)
            .field("tile_type", &self.tile_type)
            .field("zoom", &(self.min_zoom..=self.max_zoom))
            .field("min_e7", &(self.min_lon_e7.get(), self.min_lat_e7.get()))
            .field("max_e7", &(self.max_lon_e7.get(), self.max_lat_e7.get()))
            .field("center_zoom", &self.center_zoom)
            .field("center_e7", &(self.center_lon_e7.get(), self.center_lat_e7.get()))
            .finish()
    }
}

impl Header {
    /// The expected magic.
    pub const MAGIC: [u8; 7] = *b"PMTiles";

    /// Decode and validate a header from exactly [`HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = Self::read_from_bytes(bytes)
            .map_err(|_| ErrorInner::HeaderLength(bytes.len()))?;
        header.validate()?;
        Ok(header)
    }

    /// Validate if the magic matches and the format version is supported by this library.
    pub fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!(ErrorInner::InvalidMagic(self.magic));
        }
        if self.version != crate::PMTILES_VERSION {
            bail!(ErrorInner::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.clustered == 1
    }
}

macro_rules! impl_open_enum {
    ($name:ident; $($(#[$meta:meta])* $variant:ident = $value:expr,)*) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(match *self {
                    $(Self::$variant => stringify!($variant),)*
                    _ => return f.debug_tuple(stringify!($name)).field(&self.0).finish(),
                })
            }
        }

        impl $name {
            $(
                $(#[$meta])*
                pub const $variant: Self = Self($value);
            )*
        }
    };
}

/// Compression method of directories, metadata or tiles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(transparent)]
pub struct Compression(pub u8);

impl_open_enum! {
    Compression;

    /// Unknown compression. Cannot be decompressed.
    UNKNOWN = 0,
    /// Not compressed.
    NONE = 1,
    /// Gzip. Supported via feature `gzip`.
    GZIP = 2,
    /// Brotli. Not supported.
    BROTLI = 3,
    /// Zstd. Supported via feature `zstd`.
    ZSTD = 4,
}

/// Type of the tile payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(transparent)]
pub struct TileType(pub u8);

impl_open_enum! {
    TileType;

    UNKNOWN = 0,
    /// Mapbox Vector Tile.
    MVT = 1,
    PNG = 2,
    JPEG = 3,
    WEBP = 4,
    AVIF = 5,
}

impl TileType {
    /// The MIME type of this tile type, if known.
    #[must_use]
    pub fn content_type(self) -> Option<&'static str> {
        Some(match self {
            Self::MVT => "application/vnd.mapbox-vector-tile",
            Self::PNG => "image/png",
            Self::JPEG => "image/jpeg",
            Self::WEBP => "image/webp",
            Self::AVIF => "image/avif",
            _ => return None,
        })
    }
}
