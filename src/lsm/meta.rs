//! The tree's persisted metadata record.
//!
//! One record lists, in array order, every active chunk with the fields
//! needed to rebuild the tree on open, plus the id and transaction clocks.
//! The record is rewritten whole on every structural change: a bincode
//! payload framed by a magic number, a big-endian length, and a CRC-32,
//! written to a temp file and renamed into place.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use super::chunk::{Chunk, ChunkState};
use crate::errcorrupt;
use crate::error::Result;

const META_MAGIC: u32 = 0x454d_4254; // "EMBT"
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Persisted image of one active chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u32,
    pub generation: u32,
    pub count: u64,
    pub size: u64,
    pub switch_txn: u64,
    pub ondisk: bool,
    pub stable: bool,
    pub bloom: bool,
    pub empty: bool,
}

impl ChunkRecord {
    pub fn of(chunk: &Chunk) -> Self {
        use std::sync::atomic::Ordering;
        Self {
            id: chunk.id(),
            generation: chunk.generation(),
            count: chunk.count.load(Ordering::SeqCst),
            size: chunk.size.load(Ordering::SeqCst),
            switch_txn: chunk.switch_txn.load(Ordering::SeqCst),
            ondisk: chunk.is_ondisk(),
            stable: chunk.is_stable(),
            bloom: chunk.has_bloom(),
            empty: chunk.is_empty_chunk(),
        }
    }

    /// Rebuild the descriptor. `trailing` marks the last record in the
    /// array, which resumes as primary when it lacks a durable image.
    pub fn revive(&self, tree: &str, trailing: bool) -> Chunk {
        use std::sync::atomic::Ordering;
        let state = match (self.ondisk, self.bloom) {
            (true, true) => ChunkState::Bloomed,
            (true, false) => ChunkState::OnDisk,
            // A non-trailing chunk that never reached disk lost its data
            // with the process; it stays in place, empty, for diagnosis.
            (false, _) if !trailing => ChunkState::OnDisk,
            (false, _) => ChunkState::Active,
        };
        let chunk = Chunk::with_state(tree, self.id, self.generation, state);
        chunk.count.store(self.count, Ordering::SeqCst);
        chunk.size.store(self.size, Ordering::SeqCst);
        chunk.switch_txn.store(self.switch_txn, Ordering::SeqCst);
        if self.stable {
            chunk.set_stable();
        }
        if self.bloom {
            chunk.set_bloom();
        }
        if self.empty || (!self.ondisk && !trailing) {
            chunk.mark_empty();
        }
        chunk
    }
}

/// The whole persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    pub last_id: u32,
    pub last_txn: u64,
    pub chunks: Vec<ChunkRecord>,
}

impl TreeMeta {
    pub fn write(&self, path: &Path) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let tmp = path.with_extension("meta.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_u32::<BigEndian>(META_MAGIC)?;
            writer.write_u32::<BigEndian>(payload.len() as u32)?;
            writer.write_all(&payload)?;
            writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<TreeMeta> {
        let mut reader = BufReader::new(File::open(path)?);

        let magic = reader.read_u32::<BigEndian>()?;
        if magic != META_MAGIC {
            return errcorrupt!("bad tree meta magic {magic:#x} in {}", path.display());
        }
        let len = reader.read_u32::<BigEndian>()? as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let stored = reader.read_u32::<BigEndian>()?;
        if stored != CRC32.checksum(&payload) {
            return errcorrupt!("tree meta checksum mismatch in {}", path.display());
        }

        Ok(bincode::deserialize(&payload)?)
    }
}
