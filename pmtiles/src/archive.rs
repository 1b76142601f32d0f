//! The high-level interface for reading tiles from a PMTiles archive.
use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{
    cache::{DEFAULT_LEAF_CACHE_CAPACITY, LeafCache},
    compress::decompress,
    directory::{Directory, MAX_ENTRY_LENGTH},
    error::{Error, ErrorInner, Result},
    header::{Compression, HEADER_SIZE, Header, TileType},
    hilbert::{MAX_ZOOM, ZoomOffsets},
    source::{LocalSource, Source},
};

const MAX_BLOCK_SIZE: usize = MAX_ENTRY_LENGTH as usize;

/// Limits and cache sizes for opening an [`Archive`].
#[derive(Debug, Clone)]
pub struct Config {
    leaf_cache_capacity: usize,
    directory_size_limit: usize,
    metadata_size_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leaf_cache_capacity: DEFAULT_LEAF_CACHE_CAPACITY,
            directory_size_limit: 64 << 20,
            metadata_size_limit: 64 << 20,
        }
    }
}

impl Config {
    /// Maximum number of leaf directories kept in memory. 0 disables caching.
    pub fn leaf_cache_capacity(mut self, capacity: usize) -> Self {
        self.leaf_cache_capacity = capacity;
        self
    }

    /// Maximum size in bytes of a root or leaf directory block, both
    /// compressed and decompressed. Capped at `2^31 - 1`.
    pub fn directory_size_limit(mut self, limit: usize) -> Self {
        self.directory_size_limit = limit.min(MAX_BLOCK_SIZE);
        self
    }

    /// Maximum size in bytes of the metadata, both compressed and
    /// decompressed. Capped at `2^31 - 1`.
    pub fn metadata_size_limit(mut self, limit: usize) -> Self {
        self.metadata_size_limit = limit.min(MAX_BLOCK_SIZE);
        self
    }
}

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LngLat {
    pub lon: f64,
    pub lat: f64,
}

/// A geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

fn degrees(e7: i32) -> f64 {
    f64::from(e7) / 1e7
}

/// The header and root directory, replaced as a whole on re-synchronization.
#[derive(Debug)]
struct Index {
    header: Header,
    root: Directory,
}

impl Index {
    fn load<S: Source + ?Sized>(source: &S, config: &Config) -> Result<Self> {
        trace_time!("load header and root directory");

        let mut buf = [0u8; HEADER_SIZE];
        source.read_exact_at(0, &mut buf).map_err(|err| {
            if err.is_unexpected_eof() {
                ErrorInner::TruncatedHeader(err).into()
            } else {
                err.context("failed to read header")
            }
        })?;
        let header = Header::parse(&buf)?;

        let limit = config.directory_size_limit;
        let (offset, len) = (header.root_dir_offset.get(), header.root_dir_length.get());
        if len > limit as u64 {
            bail!(ErrorInner::BlockTooLarge { limit, got: len });
        }
        let mut raw = vec![0u8; len as usize];
        source
            .read_exact_at(offset, &mut raw)
            .map_err(|err| err.context(format_args!("failed to read root directory at {offset}")))?;
        let root = Directory::decode_with_limit(&raw, header.internal_compression, limit)
            .map_err(|err| err.context("failed to decode root directory"))?;
        trace!("root directory has {} entries", root.len());

        Ok(Self { header, root })
    }
}

/// Progress of one operation through the re-synchronization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Running on the index loaded before the operation started.
    Initial,
    /// The source changed once, and the index has been reloaded.
    Resynced,
}

/// A PMTiles archive opened from a [`Source`].
///
/// The header and root directory are decoded on open. Leaf directories are
/// loaded on demand and kept in a bounded LRU cache. All methods take
/// `&self` and can be called from multiple threads.
///
/// If the source reports that it changed in the middle of an operation, the
/// header and root directory are reloaded and the operation is retried once.
/// A second change fails the operation with [`ErrorKind::Io`][crate::ErrorKind::Io].
pub struct Archive<S> {
    source: S,
    config: Config,
    index: RwLock<Arc<Index>>,
    leaf_cache: LeafCache,
    zoom_offsets: ZoomOffsets,
}

impl<S: fmt::Debug> fmt::Debug for Archive<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("header", &self.index.read().header)
            .field("leaf_cache", &self.leaf_cache)
            .finish_non_exhaustive()
    }
}

impl Archive<LocalSource<std::fs::File>> {
    /// Open an archive from a local file with the default [`Config`].
    pub fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open(LocalSource::open(path)?)
    }
}

#[cfg(feature = "http")]
impl Archive<crate::HttpSource> {
    /// Open a remote archive through HTTP range requests with the default [`Config`].
    pub fn open_url(url: impl Into<String>) -> Result<Self> {
        Self::open(crate::HttpSource::new(url))
    }
}

impl<S: Source> Archive<S> {
    /// Open an archive with the default [`Config`].
    pub fn open(source: S) -> Result<Self> {
        Self::open_with_config(source, Config::default())
    }

    /// Open an archive, reading and validating its header and root directory.
    pub fn open_with_config(source: S, config: Config) -> Result<Self> {
        let index = Index::load(&source, &config)?;
        Ok(Self {
            leaf_cache: LeafCache::new(config.leaf_cache_capacity),
            source,
            config,
            index: RwLock::new(Arc::new(index)),
            zoom_offsets: ZoomOffsets::new(),
        })
    }

    /// Get a reference to the underlying source.
    pub fn get_ref(&self) -> &S {
        &self.source
    }

    /// Close the underlying source. Later reads fail.
    pub fn close(&self) {
        self.source.close();
    }

    /// Run `f` on the current index, reloading it and retrying once if the
    /// source changed.
    fn with_resync<T>(&self, mut f: impl FnMut(&Index) -> Result<T>) -> Result<T> {
        let mut attempt = Attempt::Initial;
        loop {
            // Held across `f`, so a reload never overlaps reads planned
            // against the previous index.
            let index = self.index.read();
            let err = match f(&index) {
                Err(err) if err.is_source_changed() => err,
                ret => return ret,
            };
            if attempt == Attempt::Resynced {
                bail!(ErrorInner::SourceChangedAgain(err));
            }
            let seen = Arc::clone(&*index);
            drop(index);
            self.resync(&seen, &err)?;
            attempt = Attempt::Resynced;
        }
    }

    /// Reload the index after `err` reported a change, unless another
    /// operation already replaced `seen`.
    fn resync(&self, seen: &Arc<Index>, err: &Error) -> Result<()> {
        let mut index = self.index.write();
        if !Arc::ptr_eq(&*index, seen) {
            debug!("{err}, archive index already reloaded");
            return Ok(());
        }
        debug!("{err}, reloading archive index");

        let versions = err.changed_versions();
        if let Some((_, got)) = versions {
            self.source.set_version(got);
        }
        match Index::load(&self.source, &self.config) {
            Ok(reloaded) => {
                *index = Arc::new(reloaded);
                Ok(())
            }
            Err(err) => {
                if let Some((expect, _)) = versions {
                    self.source.set_version(expect);
                }
                if err.is_source_changed() {
                    bail!(ErrorInner::SourceChangedAgain(err));
                }
                Err(err)
            }
        }
    }

    /// The globally unique tile id of `(z, x, y)`, or `None` if the
    /// coordinates are outside the grid of zoom `z` or `z` exceeds 31.
    #[must_use]
    pub fn tile_id(&self, z: u8, x: u64, y: u64) -> Option<u64> {
        if z > MAX_ZOOM || x >> z != 0 || y >> z != 0 {
            return None;
        }
        Some(self.zoom_offsets.tile_id(z, x, y))
    }

    /// The number of tile ids used by all zoom levels below `z`.
    ///
    /// # Panics
    ///
    /// Panics if `z > 31`.
    #[must_use]
    pub fn zoom_offset(&self, z: u8) -> u64 {
        self.zoom_offsets.get(z)
    }

    /// Read the raw tile data at `(z, x, y)`, still compressed with
    /// [`Archive::tile_compression`].
    ///
    /// Returns `Ok(None)` if the archive does not contain this tile.
    pub fn get_tile(&self, z: u8, x: u64, y: u64) -> Result<Option<Vec<u8>>> {
        let Some(tile_id) = self.tile_id(z, x, y) else {
            return Ok(None);
        };
        self.get_tile_by_id(tile_id)
    }

    /// Same as [`Archive::get_tile`] but addressed by a tile id.
    pub fn get_tile_by_id(&self, tile_id: u64) -> Result<Option<Vec<u8>>> {
        self.with_resync(|index| {
            index.root.find_tile(
                &index.header,
                tile_id,
                &self.source,
                &self.leaf_cache,
                self.config.directory_size_limit,
            )
        })
    }

    /// Read and decompress the JSON metadata.
    ///
    /// The text is returned without parsing. Invalid UTF-8 is a format error.
    pub fn metadata(&self) -> Result<String> {
        self.with_resync(|index| {
            let header = &index.header;
            let limit = self.config.metadata_size_limit;
            let (offset, len) = (header.metadata_offset.get(), header.metadata_length.get());
            if len == 0 {
                return Ok(String::new());
            }
            if len > limit as u64 {
                bail!(ErrorInner::BlockTooLarge { limit, got: len });
            }
            let mut raw = vec![0u8; len as usize];
            self.source
                .read_exact_at(offset, &mut raw)
                .map_err(|err| err.context(format_args!("failed to read metadata at {offset}")))?;
            let bytes = decompress(&raw, header.internal_compression, limit)
                .map_err(|err| err.context("failed to decompress metadata"))?;
            let text = String::from_utf8(bytes.into_owned())
                .map_err(|_| ErrorInner::Validation("metadata is not valid UTF-8"))?;
            Ok(text)
        })
    }

    /// The decoded header, as of the last (re)load.
    #[must_use]
    pub fn header(&self) -> Header {
        self.index.read().header
    }

    #[must_use]
    pub fn min_zoom(&self) -> u8 {
        self.header().min_zoom
    }

    #[must_use]
    pub fn max_zoom(&self) -> u8 {
        self.header().max_zoom
    }

    #[must_use]
    pub fn center_zoom(&self) -> u8 {
        self.header().center_zoom
    }

    #[must_use]
    pub fn bounds(&self) -> Bounds {
        let h = self.header();
        Bounds {
            min_lon: degrees(h.min_lon_e7.get()),
            min_lat: degrees(h.min_lat_e7.get()),
            max_lon: degrees(h.max_lon_e7.get()),
            max_lat: degrees(h.max_lat_e7.get()),
        }
    }

    #[must_use]
    pub fn center(&self) -> LngLat {
        let h = self.header();
        LngLat {
            lon: degrees(h.center_lon_e7.get()),
            lat: degrees(h.center_lat_e7.get()),
        }
    }

    #[must_use]
    pub fn tile_type(&self) -> TileType {
        self.header().tile_type
    }

    #[must_use]
    pub fn tile_compression(&self) -> Compression {
        self.header().tile_compression
    }

    /// Compression of directories and metadata.
    #[must_use]
    pub fn internal_compression(&self) -> Compression {
        self.header().internal_compression
    }

    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.header().is_clustered()
    }

    /// The cache of leaf directories, for inspection.
    pub fn leaf_cache(&self) -> &LeafCache {
        &self.leaf_cache
    }

    #[must_use]
    pub fn leaf_cache_capacity(&self) -> usize {
        self.leaf_cache.capacity()
    }

    /// Change the number of cached leaf directories. Takes effect on the
    /// next insertion.
    pub fn set_leaf_cache_capacity(&self, capacity: usize) {
        self.leaf_cache.set_capacity(capacity);
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::{FromZeros, IntoBytes, little_endian as le};

    use super::*;
    use crate::ErrorKind;

    /// An archive with an empty root directory and uncompressed `metadata`.
    fn empty_archive(metadata: &[u8]) -> Vec<u8> {
        let mut h = Header::new_zeroed();
        h.magic = Header::MAGIC;
        h.version = crate::PMTILES_VERSION;
        h.root_dir_offset = le::U64::new(HEADER_SIZE as u64);
        h.root_dir_length = le::U64::new(1);
        h.metadata_offset = le::U64::new(HEADER_SIZE as u64 + 1);
        h.metadata_length = le::U64::new(metadata.len() as u64);
        h.internal_compression = Compression::NONE;
        h.tile_type = TileType::MVT;
        h.max_zoom = 14;
        h.min_lon_e7 = le::I32::new(-1_800_000_000);
        h.max_lat_e7 = le::I32::new(850_511_287);
        h.center_lon_e7 = le::I32::new(123_456_789);
        h.center_zoom = 5;

        let mut data = h.as_bytes().to_vec();
        data.push(0);
        data.extend_from_slice(metadata);
        data
    }

    #[test]
    fn config_limits() {
        let config = Config::default()
            .leaf_cache_capacity(3)
            .directory_size_limit(usize::MAX)
            .metadata_size_limit(10);
        assert_eq!(config.leaf_cache_capacity, 3);
        assert_eq!(config.directory_size_limit, i32::MAX as usize);
        assert_eq!(config.metadata_size_limit, 10);
    }

    #[test]
    fn empty() {
        let archive = Archive::open(LocalSource::new(empty_archive(b"{}"))).unwrap();
        assert_eq!(archive.get_tile(0, 0, 0).unwrap(), None);
        assert_eq!(archive.metadata().unwrap(), "{}");
        assert_eq!(archive.tile_type(), TileType::MVT);
        assert_eq!((archive.min_zoom(), archive.max_zoom()), (0, 14));
        assert_eq!(archive.center_zoom(), 5);
        assert_eq!(archive.bounds().min_lon, -180.0);
        assert_eq!(archive.bounds().max_lat, 85.0511287);
        assert_eq!(archive.center(), LngLat { lon: 12.3456789, lat: 0.0 });
        assert!(!archive.is_clustered());
        assert_eq!(archive.leaf_cache_capacity(), DEFAULT_LEAF_CACHE_CAPACITY);

        archive.close();
        let err = archive.metadata().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn metadata_limits() {
        let config = Config::default().metadata_size_limit(1);
        let archive = Archive::open_with_config(LocalSource::new(empty_archive(b"{}")), config).unwrap();
        assert_eq!(archive.metadata().unwrap_err().kind(), ErrorKind::Format);

        let archive = Archive::open(LocalSource::new(empty_archive(b"\xff\xfe"))).unwrap();
        assert_eq!(archive.metadata().unwrap_err().kind(), ErrorKind::Format);

        let archive = Archive::open(LocalSource::new(empty_archive(b""))).unwrap();
        assert_eq!(archive.metadata().unwrap(), "");
    }

    #[test]
    fn tile_id_range() {
        let archive = Archive::open(LocalSource::new(empty_archive(b""))).unwrap();
        assert_eq!(archive.tile_id(0, 0, 0), Some(0));
        assert_eq!(archive.tile_id(0, 1, 0), None);
        assert_eq!(archive.tile_id(3, 5, 7), Some(59));
        assert_eq!(archive.tile_id(3, 8, 0), None);
        assert_eq!(archive.tile_id(32, 0, 0), None);
        assert!(archive.tile_id(31, (1 << 31) - 1, 0).is_some());
        assert_eq!(archive.zoom_offset(2), 5);
        assert_eq!(archive.get_tile(40, 0, 0).unwrap(), None);
    }

    #[test]
    fn reject_on_open() {
        let mut data = empty_archive(b"");
        data[7] = 2;
        let err = Archive::open(LocalSource::new(data)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);

        let err = Archive::open(LocalSource::new(b"PMTiles\x03".to_vec())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);

        let config = Config::default().directory_size_limit(0);
        let err = Archive::open_with_config(LocalSource::new(empty_archive(b"")), config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    /// Replays a planned sequence of reads: `true` reports a change, `false`
    /// reads normally. Reads beyond the plan succeed.
    struct Flaky {
        inner: LocalSource<Vec<u8>>,
        plan: parking_lot::Mutex<std::collections::VecDeque<bool>>,
        versions: parking_lot::Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new() -> Self {
            Self {
                inner: LocalSource::new(empty_archive(b"{}")),
                plan: Default::default(),
                versions: Default::default(),
            }
        }
    }

    impl Source for Flaky {
        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            if self.plan.lock().pop_front() == Some(true) {
                return Err(crate::Error::source_changed("a", "b"));
            }
            self.inner.read_exact_at(offset, buf)
        }

        fn set_version(&self, version: &str) {
            self.versions.lock().push(version.to_owned());
        }
    }

    #[test]
    fn resync_once() {
        let archive = Archive::open(Flaky::new()).unwrap();
        let run = |plan: &[bool]| {
            archive.get_ref().plan.lock().extend(plan);
            let ret = archive.metadata();
            assert!(archive.get_ref().plan.lock().is_empty());
            ret
        };
        let versions = || archive.get_ref().versions.lock().concat();

        assert_eq!(run(&[]).unwrap(), "{}");
        assert_eq!(versions(), "");

        // Metadata, then header, root and metadata again.
        assert_eq!(run(&[true, false, false, false]).unwrap(), "{}");
        assert_eq!(versions(), "b");

        // Changed again while reloading the header. The old version is restored.
        let err = run(&[true, true]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!err.is_source_changed());
        assert_eq!(versions(), "bba");

        // Changed again on the retried read.
        let err = run(&[true, false, false, true]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(versions(), "bbab");

        // Recovers afterwards.
        assert_eq!(run(&[]).unwrap(), "{}");
    }

    /// An archive with a single tile 0/0/0 stored after `pad`.
    fn tile_archive(pad: &[u8], tile: &[u8]) -> Vec<u8> {
        let root = [1, 0, 1, tile.len() as u8, pad.len() as u8 + 1];
        let data_offset = (HEADER_SIZE + root.len()) as u64;

        let mut h = Header::new_zeroed();
        h.magic = Header::MAGIC;
        h.version = crate::PMTILES_VERSION;
        h.root_dir_offset = le::U64::new(HEADER_SIZE as u64);
        h.root_dir_length = le::U64::new(root.len() as u64);
        h.metadata_offset = le::U64::new(data_offset);
        h.tile_data_offset = le::U64::new(data_offset);
        h.tile_data_length = le::U64::new((pad.len() + tile.len()) as u64);
        h.internal_compression = Compression::NONE;

        let mut data = h.as_bytes().to_vec();
        data.extend_from_slice(&root);
        data.extend_from_slice(pad);
        data.extend_from_slice(tile);
        data
    }

    /// Two versions of an archive. Reads fail while the served version is
    /// not the expected one.
    struct Versioned {
        contents: [LocalSource<Vec<u8>>; 2],
        served: std::sync::atomic::AtomicUsize,
        expected: parking_lot::Mutex<usize>,
        on_set_version: parking_lot::Mutex<Option<std::sync::mpsc::Sender<()>>>,
    }

    impl Source for Versioned {
        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let served = self.served.load(std::sync::atomic::Ordering::SeqCst);
            let expected = *self.expected.lock();
            if served != expected {
                return Err(crate::Error::source_changed(
                    expected.to_string(),
                    served.to_string(),
                ));
            }
            self.contents[served].read_exact_at(offset, buf)
        }

        fn set_version(&self, version: &str) {
            *self.expected.lock() = version.parse().unwrap();
            if let Some(tx) = self.on_set_version.lock().take() {
                tx.send(()).unwrap();
                // Leave the other reader time to race the reload.
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }

    #[test]
    fn concurrent_read_during_resync() {
        let (tx, rx) = std::sync::mpsc::channel();
        let source = Versioned {
            contents: [
                LocalSource::new(tile_archive(b"", b"old tile")),
                LocalSource::new(tile_archive(b"padding", b"new tile")),
            ],
            served: Default::default(),
            expected: Default::default(),
            on_set_version: parking_lot::Mutex::new(Some(tx)),
        };
        let archive = Archive::open(source).unwrap();
        assert_eq!(archive.get_tile(0, 0, 0).unwrap().unwrap(), b"old tile");

        archive.get_ref().served.store(1, std::sync::atomic::Ordering::SeqCst);
        let archive = &archive;
        std::thread::scope(|s| {
            // Starts reading while the first caller is reloading the index.
            let other = s.spawn(move || {
                rx.recv().unwrap();
                archive.get_tile(0, 0, 0)
            });
            assert_eq!(archive.get_tile(0, 0, 0).unwrap().unwrap(), b"new tile");
            assert_eq!(other.join().unwrap().unwrap().unwrap(), b"new tile");
        });
        assert_eq!(archive.header().tile_data_length.get(), 15);
    }
}
