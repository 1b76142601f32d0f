//! Root and leaf directories.
//!
//! A directory block is a varint entry count followed by four columns of
//! `count` varints each: tile id deltas, run lengths, lengths and offsets.
//! The block itself may be compressed with the header's internal
//! compression.
//!
//! An entry with a positive run length covers `run_length` consecutive tile
//! ids sharing the same tile data. An entry with run length 0 points to a leaf
//! directory instead, whose offset is relative to the leaf directory section.
//!
//! See also:
//! [PMTiles Version 3 Specification](https://github.com/protomaps/PMTiles/blob/main/spec/v3/spec.md#4-directories)
use std::{fmt, sync::Arc};

use crate::{
    cache::LeafCache,
    compress::decompress,
    error::{ErrorInner, Result},
    header::{Compression, Header},
    source::Source,
    varint::{read_varuint32, read_varuint64},
};


/// The maximum number of entries in one directory.
pub const MAX_ENTRIES: u64 = i32::MAX as u64;

/// The maximum length of a tile or a directory block.
pub const MAX_ENTRY_LENGTH: u32 = i32::MAX as u32;

/// Root plus one tier of leaf directories.
const MAX_DEPTH: usize = 2;

/// One directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entry {
    /// The first tile id covered by this entry.
    pub tile_id: u64,
    /// Number of tile ids sharing the data, or 0 for a leaf directory.
    pub run_length: u32,
    pub length: u32,
    /// Offset relative to the tile data section, or the leaf directory
    /// section for leaf entries.
    pub offset: u64,
}

impl Entry {
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.run_length == 0
    }
}

/// A decoded directory, stored as parallel columns sorted by tile id.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Directory {
    ids: Box<[u64]>,
    run_lengths: Box<[u32]>,
    lengths: Box<[u32]>,
    offsets: Box<[u64]>,
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alt = f.alternate();
        let mut d = f.debug_struct("Directory");
        d.field("len", &self.len());
        if alt {
            d.field("entries", &self.entries().collect::<Vec<_>>());
        }
        d.finish_non_exhaustive()
    }
}

impl Directory {
    /// Decompress and decode a directory block.
    pub fn decode(raw: &[u8], compression: Compression) -> Result<Self> {
        Self::decode_with_limit(raw, compression, MAX_ENTRY_LENGTH as usize)
    }

    /// Same as [`Directory::decode`] but the decompressed block must not
    /// exceed `size_limit` bytes.
    pub fn decode_with_limit(raw: &[u8], compression: Compression, size_limit: usize) -> Result<Self> {
        let bytes = decompress(raw, compression, size_limit)?;
        Self::parse(&bytes)
    }

    /// Decode an uncompressed directory block. Trailing bytes are ignored.
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        let cur = &mut bytes;
        let count = read_varuint64(cur)?;
        if count > MAX_ENTRIES {
            bail!(ErrorInner::TooManyEntries(count));
        }
        // Each entry takes at least 4 bytes. Do not trust `count` for allocation.
        let cap = (count as usize).min(cur.len() / 4);

        let mut ids = Vec::with_capacity(cap);
        let mut last_id = 0u64;
        for i in 0..count {
            let delta = read_varuint64(cur)?;
            if i != 0 && delta == 0 {
                bail!(ErrorInner::Validation("tile ids are not strictly increasing"));
            }
            last_id = last_id
                .checked_add(delta)
                .ok_or(ErrorInner::Validation("tile id overflow"))?;
            ids.push(last_id);
        }

        let mut run_lengths = Vec::with_capacity(cap);
        for _ in 0..count {
            run_lengths.push(read_varuint32(cur)?);
        }

        let mut lengths = Vec::with_capacity(cap);
        for _ in 0..count {
            let len = read_varuint32(cur)?;
            if len > MAX_ENTRY_LENGTH {
                bail!(ErrorInner::EntryTooLarge(len.into()));
            }
            lengths.push(len);
        }

        let mut offsets = Vec::<u64>::with_capacity(cap);
        for i in 0..count as usize {
            let code = read_varuint64(cur)?;
            let offset = if code != 0 {
                code - 1
            } else if let Some(&prev) = offsets.last() {
                // Contiguous with the previous entry.
                prev.checked_add(lengths[i - 1].into())
                    .ok_or(ErrorInner::Validation("entry offset overflow"))?
            } else {
                bail!(ErrorInner::Validation("first entry has no absolute offset"));
            };
            offsets.push(offset);
        }

        Ok(Self {
            ids: ids.into(),
            run_lengths: run_lengths.into(),
            lengths: lengths.into(),
            offsets: offsets.into(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The tile ids of all entries, strictly increasing.
    #[must_use]
    pub fn tile_ids(&self) -> &[u64] {
        &self.ids
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<Entry> {
        Some(Entry {
            tile_id: *self.ids.get(idx)?,
            run_length: self.run_lengths[idx],
            length: self.lengths[idx],
            offset: self.offsets[idx],
        })
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = Entry> + '_ {
        (0..self.len()).map(|i| Entry {
            tile_id: self.ids[i],
            run_length: self.run_lengths[i],
            length: self.lengths[i],
            offset: self.offsets[i],
        })
    }

    /// Find the entry covering `tile_id` in this directory alone.
    ///
    /// Returns a tile entry whose run contains `tile_id`, or the leaf entry
    /// that is the nearest at or before `tile_id`, or `None`.
    #[must_use]
    pub fn find_entry(&self, tile_id: u64) -> Option<Entry> {
        let idx = match self.ids.binary_search(&tile_id) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(insert_at) => {
                let prev = insert_at - 1;
                let run = self.run_lengths[prev];
                // Leaf entries have no run and cover everything until the next entry.
                if run == 0 || tile_id - self.ids[prev] < u64::from(run) {
                    prev
                } else {
                    return None;
                }
            }
        };
        self.get(idx)
    }

    /// Locate `tile_id` starting from this directory, descending into leaf
    /// directories, and read the tile data.
    ///
    /// Leaf directories are looked up in `cache` first, and loaded from
    /// `source` and inserted on miss. Decompressed leaf blocks must not exceed
    /// `size_limit` bytes.
    ///
    /// Returns `Ok(None)` if no directory covers `tile_id`.
    pub fn find_tile<S: Source + ?Sized>(
        &self,
        header: &Header,
        tile_id: u64,
        source: &S,
        cache: &LeafCache,
        size_limit: usize,
    ) -> Result<Option<Vec<u8>>> {
        let mut leaf: Option<Arc<Directory>> = None;
        let mut depth = 1;
        loop {
            let dir = leaf.as_deref().unwrap_or(self);
            let Some(entry) = dir.find_entry(tile_id) else {
                return Ok(None);
            };
            if !entry.is_leaf() {
                return read_tile(header, &entry, source).map(Some);
            }
            if depth == MAX_DEPTH {
                bail!(ErrorInner::Validation("leaf directories are nested too deeply"));
            }
            leaf = Some(load_leaf(header, &entry, source, cache, size_limit)?);
            depth += 1;
        }
    }

    /// Build a directory from entries sorted by strictly increasing tile ids.
    #[cfg(feature = "serialize")]
    pub fn from_entries(entries: &[Entry]) -> Result<Self> {
        if entries.len() as u64 > MAX_ENTRIES {
            bail!(ErrorInner::TooManyEntries(entries.len() as u64));
        }
        if !entries.windows(2).all(|w| w[0].tile_id < w[1].tile_id) {
            bail!(ErrorInner::Validation("tile ids are not strictly increasing"));
        }
        if let Some(e) = entries.iter().find(|e| e.length > MAX_ENTRY_LENGTH) {
            bail!(ErrorInner::EntryTooLarge(e.length.into()));
        }
        Ok(Self {
            ids: entries.iter().map(|e| e.tile_id).collect(),
            run_lengths: entries.iter().map(|e| e.run_length).collect(),
            lengths: entries.iter().map(|e| e.length).collect(),
            offsets: entries.iter().map(|e| e.offset).collect(),
        })
    }

    /// Encode into an uncompressed directory block readable by [`Directory::parse`].
    #[cfg(feature = "serialize")]
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        use crate::varint::write_varuint;

        let mut out = Vec::new();
        write_varuint(&mut out, self.len() as u64);
        let mut last_id = 0;
        for &id in &self.ids {
            write_varuint(&mut out, id - last_id);
            last_id = id;
        }
        for &run in &self.run_lengths {
            write_varuint(&mut out, run.into());
        }
        for &len in &self.lengths {
            write_varuint(&mut out, len.into());
        }
        for (i, &offset) in self.offsets.iter().enumerate() {
            let contiguous =
                i > 0 && self.offsets[i - 1] + u64::from(self.lengths[i - 1]) == offset;
            write_varuint(&mut out, if contiguous { 0 } else { offset + 1 });
        }
        out
    }
}

fn read_tile<S: Source + ?Sized>(header: &Header, entry: &Entry, source: &S) -> Result<Vec<u8>> {
    let offset = header
        .tile_data_offset
        .get()
        .checked_add(entry.offset)
        .ok_or(ErrorInner::Validation("tile offset overflow"))?;
    let mut buf = vec![0u8; entry.length as usize];
    source.read_exact_at(offset, &mut buf).map_err(|err| {
        err.context(format_args!(
            "failed to read tile data of entry {} at {offset}",
            entry.tile_id,
        ))
    })?;
    Ok(buf)
}

fn load_leaf<S: Source + ?Sized>(
    header: &Header,
    entry: &Entry,
    source: &S,
    cache: &LeafCache,
    size_limit: usize,
) -> Result<Arc<Directory>> {
    let key = entry.tile_id;
    if let Some(dir) = cache.get(key) {
        trace!("leaf {key}: cache hit");
        return Ok(dir);
    }

    trace_time!("leaf {key}: cache miss");

    (|| -> Result<Arc<Directory>> {
        let offset = header
            .leaf_dirs_offset
            .get()
            .checked_add(entry.offset)
            .ok_or(ErrorInner::Validation("leaf directory offset overflow"))?;
        if entry.length as usize > size_limit {
            bail!(ErrorInner::BlockTooLarge {
                limit: size_limit,
                got: entry.length.into(),
            });
        }
        let mut raw = vec![0u8; entry.length as usize];
        source.read_exact_at(offset, &mut raw)?;
        let dir = Arc::new(Directory::decode_with_limit(
            &raw,
            header.internal_compression,
            size_limit,
        )?);
        cache.put(key, dir.clone());
        Ok(dir)
    })()
    .map_err(|err| err.context(format_args!("failed to load leaf directory {key}")))
}
