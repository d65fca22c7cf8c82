//! Disk-backed, index-encoded sentence-pair datasets.
//!
//! A dataset directory holds three files:
//!
//! * `data.bin`: every token id, little-endian `u32`, source then target for each pair;
//! * `index.bin`: 16 bytes per pair, the `u64` token offset of the pair in `data.bin` followed
//!   by the `u32` source and target lengths;
//! * `manifest.json`: pair and token totals. It is written last, so its presence marks the
//!   dataset as complete.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{NmtError, Result};
use crate::persist::write_json_atomic;
use crate::vocab::TokenId;

/// Token payload file name.
pub const DATA_FILE: &str = "data.bin";
/// Pair index file name.
pub const INDEX_FILE: &str = "index.bin";
/// Completion marker file name.
pub const MANIFEST_FILE: &str = "manifest.json";

const FORMAT_VERSION: u32 = 1;
const INDEX_ENTRY_BYTES: usize = 16;
const TOKEN_BYTES: usize = std::mem::size_of::<TokenId>();

/// Summary stored in `manifest.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// Layout version.
    pub version: u32,
    /// Number of stored pairs.
    pub pairs: usize,
    /// Total number of stored token ids.
    pub tokens: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    source_len: u32,
    target_len: u32,
}

impl IndexEntry {
    fn to_bytes(self) -> [u8; INDEX_ENTRY_BYTES] {
        let mut bytes = [0u8; INDEX_ENTRY_BYTES];
        bytes[..8].copy_from_slice(&self.offset.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.source_len.to_le_bytes());
        bytes[12..].copy_from_slice(&self.target_len.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut offset = [0u8; 8];
        let mut source_len = [0u8; 4];
        let mut target_len = [0u8; 4];
        offset.copy_from_slice(&bytes[..8]);
        source_len.copy_from_slice(&bytes[8..12]);
        target_len.copy_from_slice(&bytes[12..16]);
        Self {
            offset: u64::from_le_bytes(offset),
            source_len: u32::from_le_bytes(source_len),
            target_len: u32::from_le_bytes(target_len),
        }
    }

    fn tokens(self) -> usize {
        self.source_len as usize + self.target_len as usize
    }
}

/// Appends pairs to a dataset directory while keeping the in-memory batch under a byte ceiling.
#[derive(Debug)]
pub struct PackedDatasetBuilder {
    dir: PathBuf,
    data: BufWriter<File>,
    index: BufWriter<File>,
    ram_limit: usize,
    batch_tokens: Vec<TokenId>,
    batch_index: Vec<IndexEntry>,
    next_offset: u64,
    pairs: usize,
    flushes: usize,
}

impl PackedDatasetBuilder {
    /// Creates (or truncates) a dataset in `dir`. `ram_limit` bounds the buffered batch in bytes.
    pub fn create<P: AsRef<Path>>(dir: P, ram_limit: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if ram_limit == 0 {
            return Err(NmtError::InvalidConfig(
                "dataset ram limit must be greater than zero".into(),
            ));
        }
        fs::create_dir_all(&dir).map_err(|err| NmtError::io_at(err, &dir))?;
        let manifest = dir.join(MANIFEST_FILE);
        if manifest.exists() {
            fs::remove_file(&manifest).map_err(|err| NmtError::io_at(err, &manifest))?;
        }
        let open = |name: &str| -> Result<BufWriter<File>> {
            let path = dir.join(name);
            File::create(&path)
                .map(BufWriter::new)
                .map_err(|err| NmtError::io_at(err, path))
        };
        Ok(Self {
            data: open(DATA_FILE)?,
            index: open(INDEX_FILE)?,
            dir,
            ram_limit,
            batch_tokens: Vec::new(),
            batch_index: Vec::new(),
            next_offset: 0,
            pairs: 0,
            flushes: 0,
        })
    }

    fn batch_bytes(&self) -> usize {
        self.batch_tokens.len() * TOKEN_BYTES + self.batch_index.len() * INDEX_ENTRY_BYTES
    }

    /// Appends one pair, flushing the current batch first when the pair would exceed the ceiling.
    pub fn add(&mut self, source: &[TokenId], target: &[TokenId]) -> Result<()> {
        let source_len = u32::try_from(source.len())
            .map_err(|_| NmtError::Internal("source sequence longer than u32::MAX".into()))?;
        let target_len = u32::try_from(target.len())
            .map_err(|_| NmtError::Internal("target sequence longer than u32::MAX".into()))?;
        let pair_bytes = (source.len() + target.len()) * TOKEN_BYTES + INDEX_ENTRY_BYTES;
        if !self.batch_index.is_empty() && self.batch_bytes() + pair_bytes > self.ram_limit {
            self.flush()?;
        }

        self.batch_index.push(IndexEntry {
            offset: self.next_offset,
            source_len,
            target_len,
        });
        self.batch_tokens.extend_from_slice(source);
        self.batch_tokens.extend_from_slice(target);
        self.next_offset += u64::from(source_len) + u64::from(target_len);
        self.pairs += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch_index.is_empty() {
            return Ok(());
        }
        let data_path = self.dir.join(DATA_FILE);
        for id in &self.batch_tokens {
            self.data
                .write_all(&id.to_le_bytes())
                .map_err(|err| NmtError::io_at(err, &data_path))?;
        }
        let index_path = self.dir.join(INDEX_FILE);
        for entry in &self.batch_index {
            self.index
                .write_all(&entry.to_bytes())
                .map_err(|err| NmtError::io_at(err, &index_path))?;
        }
        debug!(
            "flushed {} pairs ({} tokens) to {:?}",
            self.batch_index.len(),
            self.batch_tokens.len(),
            self.dir
        );
        self.batch_tokens.clear();
        self.batch_index.clear();
        self.flushes += 1;
        Ok(())
    }

    /// Pairs added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs
    }

    /// True when no pair has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs == 0
    }

    /// Number of batches written to disk so far.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Flushes the last batch, writes the manifest and reopens the dataset for reading.
    pub fn finish(mut self) -> Result<PackedDataset> {
        self.flush()?;
        let data_path = self.dir.join(DATA_FILE);
        self.data
            .flush()
            .map_err(|err| NmtError::io_at(err, &data_path))?;
        let index_path = self.dir.join(INDEX_FILE);
        self.index
            .flush()
            .map_err(|err| NmtError::io_at(err, &index_path))?;

        let manifest = DatasetManifest {
            version: FORMAT_VERSION,
            pairs: self.pairs,
            tokens: self.next_offset,
        };
        write_json_atomic(self.dir.join(MANIFEST_FILE), &manifest)?;
        PackedDataset::open(&self.dir)
    }
}

/// Read side of a finalized dataset directory.
#[derive(Debug, Clone)]
pub struct PackedDataset {
    dir: PathBuf,
    manifest: DatasetManifest,
    index: Vec<IndexEntry>,
}

impl PackedDataset {
    /// Opens a dataset; fails when the manifest is missing or disagrees with the index.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&manifest_path)
            .map_err(|err| NmtError::io_at(err, &manifest_path))?;
        let manifest: DatasetManifest = serde_json::from_str(&raw)?;
        if manifest.version != FORMAT_VERSION {
            return Err(NmtError::Serialization(format!(
                "unsupported dataset version {} in {manifest_path:?}",
                manifest.version
            )));
        }

        let index_path = dir.join(INDEX_FILE);
        let bytes = fs::read(&index_path).map_err(|err| NmtError::io_at(err, &index_path))?;
        if bytes.len() % INDEX_ENTRY_BYTES != 0 || bytes.len() / INDEX_ENTRY_BYTES != manifest.pairs
        {
            return Err(NmtError::Serialization(format!(
                "index {index_path:?} holds {} bytes, expected {} pairs",
                bytes.len(),
                manifest.pairs
            )));
        }
        let index = bytes
            .chunks_exact(INDEX_ENTRY_BYTES)
            .map(IndexEntry::from_bytes)
            .collect();
        Ok(Self {
            dir,
            manifest,
            index,
        })
    }

    /// Directory holding the dataset files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Totals recorded at finalization.
    #[must_use]
    pub fn manifest(&self) -> &DatasetManifest {
        &self.manifest
    }

    /// Number of stored pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when the dataset holds no pair.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Reads the pair stored at position `i`.
    pub fn get(&self, i: usize) -> Result<(Vec<TokenId>, Vec<TokenId>)> {
        let entry = *self.index.get(i).ok_or_else(|| {
            NmtError::InvalidConfig(format!("pair {i} out of range ({} pairs)", self.len()))
        })?;
        let path = self.dir.join(DATA_FILE);
        let mut file = File::open(&path).map_err(|err| NmtError::io_at(err, &path))?;
        file.seek(SeekFrom::Start(entry.offset * TOKEN_BYTES as u64))
            .map_err(|err| NmtError::io_at(err, &path))?;
        read_pair(&mut file, entry).map_err(|err| NmtError::io_at(err, &path))
    }

    /// Streams every pair in insertion order.
    pub fn pairs(&self) -> Result<PackedPairs<'_>> {
        let path = self.dir.join(DATA_FILE);
        let file = File::open(&path).map_err(|err| NmtError::io_at(err, &path))?;
        Ok(PackedPairs {
            reader: BufReader::new(file),
            entries: self.index.iter(),
            path,
        })
    }
}

fn read_ids<R: Read>(reader: &mut R, count: usize) -> std::io::Result<Vec<TokenId>> {
    let mut bytes = vec![0u8; count * TOKEN_BYTES];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(TOKEN_BYTES)
        .map(|chunk| TokenId::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn read_pair<R: Read>(
    reader: &mut R,
    entry: IndexEntry,
) -> std::io::Result<(Vec<TokenId>, Vec<TokenId>)> {
    let mut ids = read_ids(reader, entry.tokens())?;
    let target = ids.split_off(entry.source_len as usize);
    Ok((ids, target))
}

/// Sequential reader returned by [`PackedDataset::pairs`].
#[derive(Debug)]
pub struct PackedPairs<'a> {
    reader: BufReader<File>,
    entries: std::slice::Iter<'a, IndexEntry>,
    path: PathBuf,
}

impl Iterator for PackedPairs<'_> {
    type Item = Result<(Vec<TokenId>, Vec<TokenId>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = *self.entries.next()?;
        Some(read_pair(&mut self.reader, entry).map_err(|err| NmtError::io_at(err, &self.path)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pairs_read_back_in_order() {
        let dir = tempdir().expect("tempdir");
        let mut builder = PackedDatasetBuilder::create(dir.path(), 1 << 20).expect("create");
        builder.add(&[4, 5], &[2, 6, 3]).expect("add");
        builder.add(&[7], &[2, 3]).expect("add");
        assert_eq!(builder.len(), 2);
        let dataset = builder.finish().expect("finish");

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.manifest().tokens, 8);
        assert_eq!(dataset.get(1).expect("get"), (vec![7], vec![2, 3]));
        let pairs: Vec<_> = dataset
            .pairs()
            .expect("pairs")
            .collect::<Result<_>>()
            .expect("read");
        assert_eq!(pairs, vec![(vec![4, 5], vec![2, 6, 3]), (vec![7], vec![2, 3])]);
    }

    #[test]
    fn small_ceiling_forces_multiple_flushes() {
        let dir = tempdir().expect("tempdir");
        // Room for exactly two pairs of (2 + 2 tokens, one index entry) = 32 bytes each.
        let mut builder = PackedDatasetBuilder::create(dir.path(), 64).expect("create");
        for i in 0..5u32 {
            builder.add(&[i, i], &[2, 3]).expect("add");
        }
        assert_eq!(builder.flushes(), 2);
        let dataset = builder.finish().expect("finish");
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.get(4).expect("get"), (vec![4, 4], vec![2, 3]));
    }

    #[test]
    fn unfinished_dataset_cannot_be_opened() {
        let dir = tempdir().expect("tempdir");
        let mut builder = PackedDatasetBuilder::create(dir.path(), 1024).expect("create");
        builder.add(&[1], &[2]).expect("add");
        drop(builder);
        assert!(matches!(
            PackedDataset::open(dir.path()),
            Err(NmtError::Io { .. })
        ));
    }

    #[test]
    fn out_of_range_lookup_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let dataset = PackedDatasetBuilder::create(dir.path(), 1024)
            .expect("create")
            .finish()
            .expect("finish");
        assert!(dataset.is_empty());
        assert!(dataset.get(0).is_err());
    }
}
