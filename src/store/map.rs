//! The default chunk store.
//!
//! Each chunk is a `crossbeam_skiplist::SkipMap` from key to a version
//! chain, kept newest-first. A checkpoint writes the whole table to a single
//! file; `release` drops the in-memory image afterwards, and the next cursor
//! open reloads it from disk. The skip list gives lock-free concurrent reads
//! and ordered traversal, which is exactly what the merging cursors above
//! need.
//!
//! # Durable image layout
//!
//! ```text
//! +--------------------+
//! | magic (u32)        |
//! | key count (u64)    |
//! +--------------------+
//! | len:u32 | entry | crc32:u32 |     one frame per key, entries are
//! | len:u32 | entry | crc32:u32 |     bincode-encoded (key, chain) pairs
//! | ...                         |     in ascending key order
//! +--------------------+
//! ```
//!
//! All integers are big-endian; each frame's CRC-32 covers its payload.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use crossbeam_skiplist::SkipMap;

use super::{ChunkCursor, ChunkStat, ChunkStore, CursorOptions, Record, SearchNear};
use crate::error::{Error, Result};
use crate::txn::Snapshot;
use crate::{errcorrupt, errinput};

const MAP_MAGIC: u32 = 0x454d_424d; // "EMBM"
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Version chain for one key, newest transaction first.
type Chain = RwLock<Vec<Record>>;

struct ChunkData {
    map: SkipMap<Vec<u8>, Chain>,
    bytes: AtomicU64,
    keys: AtomicU64,
}

impl ChunkData {
    fn empty() -> Self {
        Self {
            map: SkipMap::new(),
            bytes: AtomicU64::new(0),
            keys: AtomicU64::new(0),
        }
    }

    fn append(&self, key: &[u8], value: Option<&[u8]>, txnid: u64) {
        let entry = self
            .map
            .get_or_insert_with(key.to_vec(), || RwLock::new(Vec::new()));
        let mut chain = entry.value().write().unwrap();
        if chain.is_empty() {
            self.keys.fetch_add(1, Ordering::SeqCst);
            self.bytes.fetch_add(key.len() as u64, Ordering::SeqCst);
        }
        self.bytes
            .fetch_add(value.map_or(0, <[u8]>::len) as u64, Ordering::SeqCst);
        // Concurrent writers may land out of txnid order; keep the chain
        // sorted newest-first.
        let at = chain
            .iter()
            .position(|r| r.txnid < txnid)
            .unwrap_or(chain.len());
        chain.insert(
            at,
            Record {
                txnid,
                value: value.map(<[u8]>::to_vec),
            },
        );
    }

    /// The newest record visible under the snapshot, if any.
    fn resolve(&self, chain: &Chain, snapshot: Option<Snapshot>) -> Option<Record> {
        let chain = chain.read().unwrap();
        match snapshot {
            None => chain.first().cloned(),
            Some(s) => chain.iter().find(|r| s.visible(r.txnid)).cloned(),
        }
    }
}

/// A [`ChunkStore`] holding chunks as skip lists, one durable file per
/// chunk.
pub struct MapStore {
    dir: PathBuf,
    chunks: RwLock<HashMap<String, Arc<ChunkData>>>,
    cursor_opens: AtomicU64,
}

impl MapStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            chunks: RwLock::new(HashMap::new()),
            cursor_opens: AtomicU64::new(0),
        })
    }

    fn path(&self, uri: &str) -> PathBuf {
        self.dir.join(uri)
    }

    /// Live image for the chunk, reloading the durable image if it was
    /// released.
    fn resident(&self, uri: &str) -> Result<Arc<ChunkData>> {
        if let Some(data) = self.chunks.read().unwrap().get(uri) {
            return Ok(data.clone());
        }
        let path = self.path(uri);
        if !path.exists() {
            return Err(Error::NotFound);
        }
        let loaded = Arc::new(read_image(&path)?);
        let mut chunks = self.chunks.write().unwrap();
        Ok(chunks.entry(uri.to_string()).or_insert(loaded).clone())
    }

    /// Total cursor opens served, for observing Bloom short-circuits.
    pub fn cursor_opens(&self) -> u64 {
        self.cursor_opens.load(Ordering::SeqCst)
    }
}

impl ChunkStore for MapStore {
    fn create(&self, uri: &str) -> Result<()> {
        let mut chunks = self.chunks.write().unwrap();
        if chunks.contains_key(uri) || self.path(uri).exists() {
            return Err(Error::Busy);
        }
        chunks.insert(uri.to_string(), Arc::new(ChunkData::empty()));
        Ok(())
    }

    fn drop_chunk(&self, uri: &str) -> Result<()> {
        self.chunks.write().unwrap().remove(uri);
        match fs::remove_file(self.path(uri)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn open_cursor(&self, uri: &str, opts: CursorOptions) -> Result<Box<dyn ChunkCursor>> {
        self.cursor_opens.fetch_add(1, Ordering::SeqCst);
        let data = match &opts.checkpoint {
            Some(name) if name.is_empty() => return errinput!("empty checkpoint name"),
            Some(_) => {
                let path = self.path(uri);
                if !path.exists() {
                    return Err(Error::NotFound);
                }
                Arc::new(read_image(&path)?)
            }
            None => self.resident(uri)?,
        };
        Ok(Box::new(MapCursor {
            data,
            snapshot: opts.snapshot,
            pos: None,
        }))
    }

    fn checkpoint(&self, uri: &str) -> Result<()> {
        let data = self.resident(uri)?;
        write_image(&self.path(uri), &data)
    }

    fn release(&self, uri: &str) -> Result<()> {
        if !self.path(uri).exists() {
            return errinput!("cannot release {uri}: no durable image");
        }
        self.chunks.write().unwrap().remove(uri);
        Ok(())
    }

    fn bulk_load(
        &self,
        uri: &str,
        stream: &mut dyn Iterator<Item = Result<(Vec<u8>, Record)>>,
    ) -> Result<()> {
        let data = ChunkData::empty();
        let mut last: Option<Vec<u8>> = None;
        for item in stream {
            let (key, record) = item?;
            if last.as_deref() >= Some(&key) {
                return errcorrupt!("bulk load keys out of order in {uri}");
            }
            data.append(&key, record.value.as_deref(), record.txnid);
            last = Some(key);
        }

        let mut chunks = self.chunks.write().unwrap();
        if chunks.contains_key(uri) || self.path(uri).exists() {
            return Err(Error::Busy);
        }
        chunks.insert(uri.to_string(), Arc::new(data));
        Ok(())
    }

    fn compact(&self, uri: &str) -> Result<()> {
        // Space reclamation: rewrite the durable image if one exists.
        if self.path(uri).exists() {
            let data = self.resident(uri)?;
            write_image(&self.path(uri), &data)?;
        }
        Ok(())
    }

    fn stat(&self, uri: &str) -> Result<ChunkStat> {
        let data = self.resident(uri)?;
        Ok(ChunkStat {
            bytes: data.bytes.load(Ordering::SeqCst),
            records: data.keys.load(Ordering::SeqCst),
        })
    }
}

/// Positioned cursor over one chunk. Steps reposition through the skip list
/// by key, so concurrent inserts never invalidate a position.
struct MapCursor {
    data: Arc<ChunkData>,
    snapshot: Option<Snapshot>,
    pos: Option<Pos>,
}

struct Pos {
    key: Vec<u8>,
    txnid: u64,
    value: Option<Vec<u8>>,
}

impl MapCursor {
    fn take_pos(&mut self, found: Option<(Vec<u8>, Record)>) -> bool {
        self.pos = found.map(|(key, record)| Pos {
            key,
            txnid: record.txnid,
            value: record.value,
        });
        self.pos.is_some()
    }

    /// First visible entry at or beyond the bound, walking forward.
    fn visible_forward(&self, bound: Bound<&[u8]>) -> Option<(Vec<u8>, Record)> {
        let mut entry = self.data.map.lower_bound(bound);
        while let Some(e) = entry {
            if let Some(record) = self.data.resolve(e.value(), self.snapshot) {
                return Some((e.key().clone(), record));
            }
            entry = e.next();
        }
        None
    }

    /// Last visible entry at or below the bound, walking backward.
    fn visible_backward(&self, bound: Bound<&[u8]>) -> Option<(Vec<u8>, Record)> {
        let mut entry = self.data.map.upper_bound(bound);
        while let Some(e) = entry {
            if let Some(record) = self.data.resolve(e.value(), self.snapshot) {
                return Some((e.key().clone(), record));
            }
            entry = e.prev();
        }
        None
    }

    fn seek_forward(&mut self, bound: Bound<&[u8]>) -> Result<bool> {
        let found = self.visible_forward(bound);
        Ok(self.take_pos(found))
    }

    fn seek_backward(&mut self, bound: Bound<&[u8]>) -> Result<bool> {
        let found = self.visible_backward(bound);
        Ok(self.take_pos(found))
    }
}

impl ChunkCursor for MapCursor {
    fn search(&mut self, key: &[u8]) -> Result<bool> {
        let found = self
            .data
            .map
            .get(key)
            .and_then(|entry| self.data.resolve(entry.value(), self.snapshot))
            .map(|record| (key.to_vec(), record));
        Ok(self.take_pos(found))
    }

    fn search_near(&mut self, key: &[u8]) -> Result<Option<SearchNear>> {
        if self.search(key)? {
            return Ok(Some(SearchNear::Exact));
        }
        if self.seek_forward(Bound::Excluded(key))? {
            return Ok(Some(SearchNear::After));
        }
        if self.seek_backward(Bound::Excluded(key))? {
            return Ok(Some(SearchNear::Before));
        }
        Ok(None)
    }

    fn next(&mut self) -> Result<bool> {
        match self.pos.take() {
            Some(pos) => self.seek_forward(Bound::Excluded(&pos.key)),
            None => self.seek_forward(Bound::Unbounded),
        }
    }

    fn prev(&mut self) -> Result<bool> {
        match self.pos.take() {
            Some(pos) => self.seek_backward(Bound::Excluded(&pos.key)),
            None => self.seek_backward(Bound::Unbounded),
        }
    }

    fn key(&self) -> Result<&[u8]> {
        self.pos.as_ref().map(|p| p.key.as_slice()).ok_or(Error::NotFound)
    }

    fn value(&self) -> Result<Option<&[u8]>> {
        self.pos
            .as_ref()
            .map(|p| p.value.as_deref())
            .ok_or(Error::NotFound)
    }

    fn txnid(&self) -> Result<u64> {
        self.pos.as_ref().map(|p| p.txnid).ok_or(Error::NotFound)
    }

    fn insert(&mut self, key: &[u8], value: Option<&[u8]>, txnid: u64) -> Result<()> {
        self.data.append(key, value, txnid);
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: &[u8], txnid: u64) -> Result<()> {
        if !self.search(key)? || self.value()?.is_none() {
            return Err(Error::NotFound);
        }
        self.data.append(key, Some(value), txnid);
        Ok(())
    }

    fn remove(&mut self, key: &[u8], txnid: u64) -> Result<()> {
        if !self.search(key)? || self.value()?.is_none() {
            return Err(Error::NotFound);
        }
        self.data.append(key, None, txnid);
        Ok(())
    }

    fn reset(&mut self) {
        self.pos = None;
    }
}

fn write_image(path: &Path, data: &ChunkData) -> Result<()> {
    let tmp = path.with_extension("lsm.tmp");
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        writer.write_u32::<BigEndian>(MAP_MAGIC)?;
        writer.write_u64::<BigEndian>(data.map.len() as u64)?;

        for entry in data.map.iter() {
            let chain = entry.value().read().unwrap().clone();
            let payload = bincode::serialize(&(entry.key(), &chain))?;
            writer.write_u32::<BigEndian>(payload.len() as u32)?;
            writer.write_all(&payload)?;
            writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_image(path: &Path) -> Result<ChunkData> {
    let mut reader = BufReader::new(File::open(path)?);

    let magic = reader.read_u32::<BigEndian>()?;
    if magic != MAP_MAGIC {
        return errcorrupt!("bad chunk magic {magic:#x} in {}", path.display());
    }
    let nkeys = reader.read_u64::<BigEndian>()?;

    let data = ChunkData::empty();
    for _ in 0..nkeys {
        let len = reader.read_u32::<BigEndian>()? as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let stored = reader.read_u32::<BigEndian>()?;
        if stored != CRC32.checksum(&payload) {
            return errcorrupt!("chunk frame checksum mismatch in {}", path.display());
        }

        let (key, chain): (Vec<u8>, Vec<Record>) = bincode::deserialize(&payload)?;
        for record in chain.iter().rev() {
            data.append(&key, record.value.as_deref(), record.txnid);
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use crate::txn::TxnManager;

    fn open_store(dir: &TempDir) -> MapStore {
        MapStore::new(dir.path()).unwrap()
    }

    fn cursor(store: &MapStore, uri: &str) -> Box<dyn ChunkCursor> {
        store.open_cursor(uri, CursorOptions::default()).unwrap()
    }

    #[test]
    fn test_insert_and_search() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        cur.insert(b"a", Some(b"1"), 1).unwrap();
        cur.insert(b"b", Some(b"2"), 2).unwrap();

        assert!(cur.search(b"a").unwrap());
        assert_eq!(cur.value().unwrap(), Some(&b"1"[..]));
        assert_eq!(cur.txnid().unwrap(), 1);
        assert!(!cur.search(b"z").unwrap());
    }

    #[test]
    fn test_snapshot_filters_versions() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();
        let txns = TxnManager::new();

        let mut writer = cursor(&store, "c-1.lsm");
        writer.insert(b"k", Some(b"v1"), txns.allocate()).unwrap();
        let mid = txns.snapshot();
        writer.insert(b"k", Some(b"v2"), txns.allocate()).unwrap();

        let mut latest = cursor(&store, "c-1.lsm");
        assert!(latest.search(b"k").unwrap());
        assert_eq!(latest.value().unwrap(), Some(&b"v2"[..]));

        let mut pinned = store
            .open_cursor(
                "c-1.lsm",
                CursorOptions {
                    snapshot: Some(mid),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(pinned.search(b"k").unwrap());
        assert_eq!(pinned.value().unwrap(), Some(&b"v1"[..]));
    }

    #[test]
    fn test_search_near() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        cur.insert(b"b", Some(b"1"), 1).unwrap();
        cur.insert(b"d", Some(b"2"), 2).unwrap();

        assert_eq!(cur.search_near(b"b").unwrap(), Some(SearchNear::Exact));
        assert_eq!(cur.search_near(b"c").unwrap(), Some(SearchNear::After));
        assert_eq!(cur.key().unwrap(), b"d");
        assert_eq!(cur.search_near(b"e").unwrap(), Some(SearchNear::Before));
        assert_eq!(cur.key().unwrap(), b"b");

        let mut empty = {
            store.create("c-2.lsm").unwrap();
            cursor(&store, "c-2.lsm")
        };
        assert_eq!(empty.search_near(b"a").unwrap(), None);
    }

    #[test]
    fn test_bidirectional_iteration() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            cur.insert(*key, Some(b"v"), i as u64 + 1).unwrap();
        }

        cur.reset();
        assert!(cur.next().unwrap());
        assert_eq!(cur.key().unwrap(), b"a");
        assert!(cur.next().unwrap());
        assert_eq!(cur.key().unwrap(), b"b");
        assert!(cur.prev().unwrap());
        assert_eq!(cur.key().unwrap(), b"a");
        assert!(!cur.prev().unwrap());

        cur.reset();
        assert!(cur.prev().unwrap());
        assert_eq!(cur.key().unwrap(), b"c");
    }

    #[test]
    fn test_tombstones_are_surfaced() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        cur.insert(b"k", Some(b"v"), 1).unwrap();
        cur.remove(b"k", 2).unwrap();

        assert!(cur.search(b"k").unwrap());
        assert_eq!(cur.value().unwrap(), None);

        // remove of a tombstoned key reports NotFound
        assert_eq!(cur.remove(b"k", 3), Err(Error::NotFound));
    }

    #[test]
    fn test_checkpoint_release_reload() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        cur.insert(b"a", Some(b"1"), 1).unwrap();
        cur.insert(b"b", None, 2).unwrap();
        drop(cur);

        store.checkpoint("c-1.lsm").unwrap();
        store.release("c-1.lsm").unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        assert!(cur.search(b"a").unwrap());
        assert_eq!(cur.value().unwrap(), Some(&b"1"[..]));
        assert!(cur.search(b"b").unwrap());
        assert_eq!(cur.value().unwrap(), None);

        let stat = store.stat("c-1.lsm").unwrap();
        assert_eq!(stat.records, 2);
    }

    #[test]
    fn test_release_without_image_fails() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();
        assert!(store.release("c-1.lsm").is_err());
    }

    #[test]
    fn test_bulk_load_rejects_disorder() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let rec = |v: &[u8]| Record {
            txnid: 1,
            value: Some(v.to_vec()),
        };
        let mut ordered = vec![
            Ok((b"a".to_vec(), rec(b"1"))),
            Ok((b"b".to_vec(), rec(b"2"))),
        ]
        .into_iter();
        store.bulk_load("c-1.lsm", &mut ordered).unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        assert!(cur.search(b"b").unwrap());

        let mut unordered = vec![
            Ok((b"b".to_vec(), rec(b"2"))),
            Ok((b"a".to_vec(), rec(b"1"))),
        ]
        .into_iter();
        assert!(matches!(
            store.bulk_load("c-2.lsm", &mut unordered),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_checkpoint_cursor_ignores_live_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create("c-1.lsm").unwrap();

        let mut cur = cursor(&store, "c-1.lsm");
        cur.insert(b"a", Some(b"old"), 1).unwrap();
        drop(cur);
        store.checkpoint("c-1.lsm").unwrap();

        let mut live = cursor(&store, "c-1.lsm");
        live.insert(b"a", Some(b"new"), 2).unwrap();

        let mut ckpt = store
            .open_cursor(
                "c-1.lsm",
                CursorOptions {
                    checkpoint: Some("last".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(ckpt.search(b"a").unwrap());
        assert_eq!(ckpt.value().unwrap(), Some(&b"old"[..]));
    }
}
