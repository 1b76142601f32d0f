//! Fixture archives and instrumented sources for integration tests.
use std::{
    collections::{BTreeMap, HashMap},
    io::Write,
    ops::Range,
};

use parking_lot::Mutex;
use pmtiles::{
    Compression, Directory, Entry, Header, LocalSource, Result, Source, TileType,
    header::HEADER_SIZE, hilbert::ZoomOffsets,
};
use zerocopy::{FromZeros, IntoBytes, little_endian as le};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Payload of tile 0/0/0 in [`sample`]. Its MD5 is well-known.
pub const SAMPLE_ROOT_TILE: &[u8] = b"The quick brown fox jumps over the lazy dog";

/// A complete pyramid of zoom 0 to 3 with distinct payloads, except 3/4/7
/// and 3/5/7 sharing theirs.
#[must_use]
pub fn sample() -> ArchiveBuilder {
    let mut b = ArchiveBuilder::new();
    for z in 0..=3u8 {
        for x in 0..1u64 << z {
            for y in 0..1u64 << z {
                b = b.tile(z, x, y, format!("tile {z}/{x}/{y}"));
            }
        }
    }
    b.tile(0, 0, 0, SAMPLE_ROOT_TILE)
        .tile(3, 4, 7, "shared")
        .tile(3, 5, 7, "shared")
        .metadata(r#"{"name":"sample","type":"baselayer"}"#)
}

/// Builds archives in memory.
///
/// Consecutive tile ids with equal payloads are collapsed into one run, and
/// equal payloads are stored once. Tile data is laid out in tile id order.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    tiles: BTreeMap<u64, Vec<u8>>,
    zoom: Option<(u8, u8)>,
    metadata: Vec<u8>,
    internal_compression: Compression,
    tile_compression: Compression,
    tile_type: TileType,
    bounds_e7: [i32; 4],
    center: (u8, i32, i32),
    leaf_size: Option<usize>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn e7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

/// The HTTP `Range` header value requesting `range`.
#[must_use]
pub fn http_range(range: &Range<u64>) -> String {
    format!("bytes={}-{}", range.start, range.end - 1)
}

impl ArchiveBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiles: BTreeMap::new(),
            zoom: None,
            metadata: b"{}".to_vec(),
            internal_compression: Compression::GZIP,
            tile_compression: Compression::NONE,
            tile_type: TileType::PNG,
            bounds_e7: [e7(-180.0), e7(-85.0), e7(180.0), e7(85.0)],
            center: (0, 0, 0),
            leaf_size: None,
        }
    }

    #[must_use]
    pub fn tile(mut self, z: u8, x: u64, y: u64, data: impl Into<Vec<u8>>) -> Self {
        let id = ZoomOffsets::new().tile_id(z, x, y);
        self.tiles.insert(id, data.into());
        self.zoom = Some(match self.zoom {
            Some((lo, hi)) => (lo.min(z), hi.max(z)),
            None => (z, z),
        });
        self
    }

    #[must_use]
    pub fn metadata(mut self, json: impl Into<Vec<u8>>) -> Self {
        self.metadata = json.into();
        self
    }

    /// Only [`Compression::NONE`] and [`Compression::GZIP`] can be written.
    #[must_use]
    pub fn internal_compression(mut self, c: Compression) -> Self {
        assert!(matches!(c, Compression::NONE | Compression::GZIP));
        self.internal_compression = c;
        self
    }

    /// Only recorded in the header. Payloads are stored as given.
    #[must_use]
    pub fn tile_compression(mut self, c: Compression) -> Self {
        self.tile_compression = c;
        self
    }

    #[must_use]
    pub fn tile_type(mut self, ty: TileType) -> Self {
        self.tile_type = ty;
        self
    }

    #[must_use]
    pub fn bounds(mut self, min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        self.bounds_e7 = [e7(min_lon), e7(min_lat), e7(max_lon), e7(max_lat)];
        self
    }

    #[must_use]
    pub fn center(mut self, zoom: u8, lon: f64, lat: f64) -> Self {
        self.center = (zoom, e7(lon), e7(lat));
        self
    }

    /// Split entries into leaf directories of at most `n` entries each.
    #[must_use]
    pub fn leaf_size(mut self, n: usize) -> Self {
        assert_ne!(n, 0);
        self.leaf_size = Some(n);
        self
    }

    fn compress(&self, raw: &[u8]) -> Vec<u8> {
        if self.internal_compression == Compression::NONE {
            return raw.to_vec();
        }
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(raw).unwrap();
        enc.finish().unwrap()
    }

    #[must_use]
    pub fn build(&self) -> Fixture {
        let mut tile_data = Vec::new();
        let mut contents = HashMap::<&[u8], (u64, u32)>::new();
        let mut entries = Vec::<Entry>::new();
        let mut tiles = BTreeMap::new();
        for (&id, payload) in &self.tiles {
            let (offset, length) = *contents.entry(payload.as_slice()).or_insert_with(|| {
                let offset = tile_data.len() as u64;
                tile_data.extend_from_slice(payload);
                (offset, payload.len() as u32)
            });
            tiles.insert(id, offset..offset + u64::from(length));
            match entries.last_mut() {
                Some(last)
                    if last.tile_id + u64::from(last.run_length) == id
                        && (last.offset, last.length) == (offset, length) =>
                {
                    last.run_length += 1;
                }
                _ => entries.push(Entry {
                    tile_id: id,
                    run_length: 1,
                    length,
                    offset,
                }),
            }
        }

        let encode = |entries: &[Entry]| {
            self.compress(&Directory::from_entries(entries).unwrap().to_bytes())
        };
        let mut leaf_section = Vec::new();
        let mut leaves = Vec::new();
        let root = match self.leaf_size {
            None => encode(&entries),
            Some(n) => {
                let mut root_entries = Vec::new();
                for chunk in entries.chunks(n) {
                    let blob = encode(chunk);
                    let offset = leaf_section.len() as u64;
                    root_entries.push(Entry {
                        tile_id: chunk[0].tile_id,
                        run_length: 0,
                        length: blob.len() as u32,
                        offset,
                    });
                    leaves.push(offset..offset + blob.len() as u64);
                    leaf_section.extend_from_slice(&blob);
                }
                encode(&root_entries)
            }
        };
        let metadata = self.compress(&self.metadata);

        let root_offset = HEADER_SIZE as u64;
        let metadata_offset = root_offset + root.len() as u64;
        let leaf_offset = metadata_offset + metadata.len() as u64;
        let tile_offset = leaf_offset + leaf_section.len() as u64;

        let (min_zoom, max_zoom) = self.zoom.unwrap_or((0, 0));
        let mut h = Header::new_zeroed();
        h.magic = Header::MAGIC;
        h.version = pmtiles::PMTILES_VERSION;
        h.root_dir_offset = le::U64::new(root_offset);
        h.root_dir_length = le::U64::new(root.len() as u64);
        h.metadata_offset = le::U64::new(metadata_offset);
        h.metadata_length = le::U64::new(metadata.len() as u64);
        h.leaf_dirs_offset = le::U64::new(leaf_offset);
        h.leaf_dirs_length = le::U64::new(leaf_section.len() as u64);
        h.tile_data_offset = le::U64::new(tile_offset);
        h.tile_data_length = le::U64::new(tile_data.len() as u64);
        h.addressed_tiles = le::U64::new(self.tiles.len() as u64);
        h.tile_entries = le::U64::new(entries.len() as u64);
        h.tile_contents = le::U64::new(contents.len() as u64);
        h.clustered = 1;
        h.internal_compression = self.internal_compression;
        h.tile_compression = self.tile_compression;
        h.tile_type = self.tile_type;
        h.min_zoom = min_zoom;
        h.max_zoom = max_zoom;
        h.min_lon_e7 = le::I32::new(self.bounds_e7[0]);
        h.min_lat_e7 = le::I32::new(self.bounds_e7[1]);
        h.max_lon_e7 = le::I32::new(self.bounds_e7[2]);
        h.max_lat_e7 = le::I32::new(self.bounds_e7[3]);
        h.center_zoom = self.center.0;
        h.center_lon_e7 = le::I32::new(self.center.1);
        h.center_lat_e7 = le::I32::new(self.center.2);

        let mut data = h.as_bytes().to_vec();
        data.extend_from_slice(&root);
        data.extend_from_slice(&metadata);
        data.extend_from_slice(&leaf_section);
        data.extend_from_slice(&tile_data);

        let shift = |r: Range<u64>, base: u64| r.start + base..r.end + base;
        Fixture {
            data,
            header: h,
            tiles: tiles
                .into_iter()
                .map(|(id, r)| (id, shift(r, tile_offset)))
                .collect(),
            leaves: leaves.into_iter().map(|r| shift(r, leaf_offset)).collect(),
        }
    }
}

/// A built archive with the locations of its parts.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub data: Vec<u8>,
    pub header: Header,
    tiles: BTreeMap<u64, Range<u64>>,
    leaves: Vec<Range<u64>>,
}

impl Fixture {
    /// An in-memory source over a copy of the archive bytes.
    #[must_use]
    pub fn source(&self) -> LocalSource<Vec<u8>> {
        LocalSource::new(self.data.clone())
    }

    /// Write the archive into a temporary file.
    #[must_use]
    pub fn to_temp_file(&self) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&self.data).unwrap();
        f.flush().unwrap();
        f
    }

    #[must_use]
    pub fn header_range(&self) -> Range<u64> {
        0..HEADER_SIZE as u64
    }

    #[must_use]
    pub fn root_range(&self) -> Range<u64> {
        let start = self.header.root_dir_offset.get();
        start..start + self.header.root_dir_length.get()
    }

    /// Absolute byte range of the payload of `tile_id`.
    #[must_use]
    pub fn tile_range(&self, tile_id: u64) -> Option<Range<u64>> {
        self.tiles.get(&tile_id).cloned()
    }

    /// Absolute byte ranges of leaf directories, in tile id order.
    #[must_use]
    pub fn leaf_ranges(&self) -> &[Range<u64>] {
        &self.leaves
    }

    /// Index into [`Fixture::leaf_ranges`] of the leaf covering `tile_id`.
    #[must_use]
    pub fn leaf_of(&self, tile_id: u64) -> Option<usize> {
        let root = Directory::decode(
            &self.data[self.root_range().start as usize..self.root_range().end as usize],
            self.header.internal_compression,
        )
        .unwrap();
        let entry = root.find_entry(tile_id)?;
        entry.is_leaf().then(|| {
            let start = self.header.leaf_dirs_offset.get() + entry.offset;
            self.leaves.iter().position(|r| r.start == start).unwrap()
        })
    }

    /// Replace the header in the archive bytes.
    pub fn patch_header(&mut self, f: impl FnOnce(&mut Header)) {
        f(&mut self.header);
        self.data[..HEADER_SIZE].copy_from_slice(self.header.as_bytes());
    }
}

/// A source recording the byte range of every successful or failed read.
#[derive(Debug)]
pub struct RecordingSource<S> {
    inner: S,
    reads: Mutex<Vec<Range<u64>>>,
}

impl<S> RecordingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: Mutex::new(Vec::new()),
        }
    }

    /// Return and forget reads recorded so far.
    pub fn take_reads(&self) -> Vec<Range<u64>> {
        std::mem::take(&mut *self.reads.lock())
    }
}

impl<S: Source> Source for RecordingSource<S> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.reads.lock().push(offset..offset + buf.len() as u64);
        self.inner.read_exact_at(offset, buf)
    }

    fn set_version(&self, version: &str) {
        self.inner.set_version(version);
    }

    fn close(&self) {
        self.inner.close();
    }
}
