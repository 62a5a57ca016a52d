//! Bloom filters over sealed chunks.
//!
//! A filter is sized as `bit_count` bits per record and probed with
//! `hash_count` positions derived by double hashing: a single 128-bit xxh3
//! digest is split into two 64-bit halves h1/h2, and probe i reads bit
//! `(h1 + i * h2) mod nbits`. A negative answer is authoritative; a positive
//! answer may be spurious.
//!
//! On-disk image: `[magic u32][hash_count u32][nbits u64][words...]` followed
//! by a CRC-32 of everything before it, all big-endian.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use xxhash_rust::xxh3::xxh3_128;

use crate::errcorrupt;
use crate::error::Result;

const BLOOM_MAGIC: u32 = 0x454d_4246; // "EMBF"
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct BloomFilter {
    words: Vec<u64>,
    nbits: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Create an empty filter sized for `count` records at `bit_count` bits
    /// per record.
    pub fn new(count: u64, bit_count: u32, hash_count: u32) -> Self {
        let nbits = (count.max(1)).saturating_mul(bit_count as u64).max(64);
        let nwords = nbits.div_ceil(64) as usize;
        Self {
            words: vec![0u64; nwords],
            nbits,
            hash_count: hash_count.max(1),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = split_hash(key);
        for i in 0..self.hash_count {
            let bit = probe(h1, h2, i, self.nbits);
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// False means the key is definitely absent from the chunk.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = split_hash(key);
        for i in 0..self.hash_count {
            let bit = probe(h1, h2, i, self.nbits);
            if self.words[(bit / 64) as usize] >> (bit % 64) & 1 == 0 {
                return false;
            }
        }
        true
    }

    /// Persist the finished filter. The write is atomic: a temp file is
    /// renamed over the target once fully written.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("bf.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);

            let mut digest = CRC32.digest();
            write_u32(&mut writer, &mut digest, BLOOM_MAGIC)?;
            write_u32(&mut writer, &mut digest, self.hash_count)?;
            write_u64(&mut writer, &mut digest, self.nbits)?;
            for &word in &self.words {
                write_u64(&mut writer, &mut digest, word)?;
            }
            writer.write_u32::<BigEndian>(digest.finalize())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a previously persisted filter.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut digest = CRC32.digest();

        let magic = read_u32(&mut reader, &mut digest)?;
        if magic != BLOOM_MAGIC {
            return errcorrupt!("bad bloom magic {magic:#x} in {}", path.display());
        }
        let hash_count = read_u32(&mut reader, &mut digest)?;
        let nbits = read_u64(&mut reader, &mut digest)?;
        let nwords = nbits.div_ceil(64) as usize;
        let mut words = Vec::with_capacity(nwords);
        for _ in 0..nwords {
            words.push(read_u64(&mut reader, &mut digest)?);
        }

        let stored = reader.read_u32::<BigEndian>()?;
        if stored != digest.finalize() {
            return errcorrupt!("bloom checksum mismatch in {}", path.display());
        }

        Ok(Self {
            words,
            nbits,
            hash_count,
        })
    }
}

fn split_hash(key: &[u8]) -> (u64, u64) {
    let digest = xxh3_128(key);
    (digest as u64, (digest >> 64) as u64)
}

fn probe(h1: u64, h2: u64, i: u32, nbits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % nbits
}

fn write_u32(w: &mut impl Write, digest: &mut crc::Digest<u32>, v: u32) -> Result<()> {
    digest.update(&v.to_be_bytes());
    w.write_u32::<BigEndian>(v)?;
    Ok(())
}

fn write_u64(w: &mut impl Write, digest: &mut crc::Digest<u32>, v: u64) -> Result<()> {
    digest.update(&v.to_be_bytes());
    w.write_u64::<BigEndian>(v)?;
    Ok(())
}

fn read_u32(r: &mut impl Read, digest: &mut crc::Digest<u32>) -> Result<u32> {
    let v = r.read_u32::<BigEndian>()?;
    digest.update(&v.to_be_bytes());
    Ok(v)
}

fn read_u64(r: &mut impl Read, digest: &mut crc::Digest<u32>) -> Result<u64> {
    let v = r.read_u64::<BigEndian>()?;
    digest.update(&v.to_be_bytes());
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_membership() {
        let mut filter = BloomFilter::new(100, 16, 8);
        filter.insert(b"hearth");
        filter.insert(b"kindling");

        assert!(filter.contains(b"hearth"));
        assert!(filter.contains(b"kindling"));
        assert!(!filter.contains(b"water"));
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 16, 8);
        for i in 0..1000u32 {
            filter.insert(format!("key_{i:04}").as_bytes());
        }
        for i in 0..1000u32 {
            assert!(filter.contains(format!("key_{i:04}").as_bytes()));
        }
    }

    #[test]
    fn test_persist_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-1.bf");

        let mut filter = BloomFilter::new(64, 16, 8);
        filter.insert(b"alpha");
        filter.insert(b"beta");
        filter.write_to(&path).unwrap();

        let loaded = BloomFilter::open(&path).unwrap();
        assert!(loaded.contains(b"alpha"));
        assert!(loaded.contains(b"beta"));
        assert!(!loaded.contains(b"gamma"));
    }

    #[test]
    fn test_open_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-2.bf");

        let mut filter = BloomFilter::new(64, 16, 8);
        filter.insert(b"alpha");
        filter.write_to(&path).unwrap();

        // Flip a byte in the middle of the image.
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            BloomFilter::open(&path),
            Err(crate::Error::Corrupt(_))
        ));
    }
}
