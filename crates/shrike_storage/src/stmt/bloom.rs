//! Bloom filter over statement keys for run-file negative lookups.
//!
//! A run file carries a filter of every key it contains; a point lookup
//! checks it first and skips the file on a definite miss. Statements
//! enter and probe the filter through one pair of operations that accept
//! both shapes: a full row is hashed through its key definition, a bare
//! key is hashed from its payload parts directly, and equal keys hash
//! identically whichever side they came from.

use std::hash::Hasher;

use crate::format::KeyDef;
use crate::msgpack::MpRead;
use crate::stmt::layout::StmtRead;

/// Hash of one statement's key: the concatenated MessagePack bytes of
/// its key parts, in definition order, a part missing from the row
/// hashed as nil (which is exactly what key extraction materializes).
fn statement_key_hash<S: StmtRead>(stmt: &S, key_def: &KeyDef) -> u64 {
    let mut hasher = FnvHasher::new();
    if stmt.is_key() {
        let payload = stmt.payload();
        let mut rd = MpRead::new(payload);
        let count = rd.read_array();
        debug_assert!(count >= key_def.part_count(), "bare key shorter than the key definition");
        for _ in 0..key_def.part_count() {
            let start = rd.pos();
            rd.skip();
            hasher.write(&payload[start..rd.pos()]);
        }
    } else {
        let tuple = stmt.tuple_data();
        for range in key_def.part_ranges(tuple) {
            match range {
                Some((start, end)) => hasher.write(&tuple[start..end]),
                None => hasher.write(&[0xc0]),
            }
        }
    }
    hasher.finish()
}

/// Accumulates key hashes while a run is written, then sizes the filter
/// for exactly the keys it saw.
#[derive(Debug, Default)]
pub struct KeyBloomBuilder {
    hashes: Vec<u64>,
}

impl KeyBloomBuilder {
    pub fn new() -> KeyBloomBuilder {
        KeyBloomBuilder::default()
    }

    /// Account one statement's key.
    pub fn add<S: StmtRead>(&mut self, stmt: &S, key_def: &KeyDef) {
        self.hashes.push(statement_key_hash(stmt, key_def));
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Build the filter with the given false-positive rate (e.g. 0.01).
    pub fn build(&self, fp_rate: f64) -> KeyBloom {
        let mut bloom = KeyBloom::with_capacity(self.hashes.len(), fp_rate);
        for &h in &self.hashes {
            bloom.insert_hash(h);
        }
        bloom
    }
}

/// Double-hashing (Kirsch-Mitzenmacker) bloom filter keyed by statement
/// key hashes.
#[derive(Debug, Clone)]
pub struct KeyBloom {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

impl KeyBloom {
    fn with_capacity(expected_keys: usize, fp_rate: f64) -> KeyBloom {
        let expected_keys = expected_keys.max(1);
        let fp_rate = fp_rate.clamp(1e-10, 1.0);

        // Optimal number of bits: m = -n * ln(p) / (ln2)^2
        let num_bits = (-(expected_keys as f64) * fp_rate.ln() / (2.0_f64.ln().powi(2)))
            .ceil() as usize;
        let num_bits = num_bits.max(64);

        // Optimal number of hashes: k = (m/n) * ln2
        let num_hashes = ((num_bits as f64 / expected_keys as f64) * 2.0_f64.ln())
            .ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        let words = num_bits.div_ceil(64);
        KeyBloom {
            bits: vec![0u64; words],
            num_bits,
            num_hashes,
        }
    }

    /// Probe the filter with a statement's key. `false` means the key is
    /// definitely absent from the run.
    pub fn maybe_has<S: StmtRead>(&self, stmt: &S, key_def: &KeyDef) -> bool {
        let h = statement_key_hash(stmt, key_def);
        let (h1, h2) = split_hash(h);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            if self.bits[idx / 64] & (1u64 << (idx % 64)) == 0 {
                return false;
            }
        }
        true
    }

    fn insert_hash(&mut self, h: u64) {
        let (h1, h2) = split_hash(h);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[idx / 64] |= 1u64 << (idx % 64);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        let combined = h1.wrapping_add(u64::from(i).wrapping_mul(h2));
        (combined % self.num_bits as u64) as usize
    }

    /// Serialize for the run-file footer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.bits.len() * 8);
        buf.extend_from_slice(&(self.num_bits as u32).to_le_bytes());
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        for word in &self.bits {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<KeyBloom> {
        if data.len() < 12 {
            return None;
        }
        let num_bits = u32::from_le_bytes(data[0..4].try_into().ok()?) as usize;
        let num_hashes = u32::from_le_bytes(data[4..8].try_into().ok()?);
        let word_count = u32::from_le_bytes(data[8..12].try_into().ok()?) as usize;
        if data.len() < 12 + word_count * 8 {
            return None;
        }
        let mut bits = Vec::with_capacity(word_count);
        for i in 0..word_count {
            let offset = 12 + i * 8;
            bits.push(u64::from_le_bytes(data[offset..offset + 8].try_into().ok()?));
        }
        Some(KeyBloom {
            bits,
            num_bits,
            num_hashes,
        })
    }

    pub fn size_bits(&self) -> usize {
        self.num_bits
    }
}

/// Derive the double-hashing pair from one stored hash (splitmix64
/// finalizer for the second).
fn split_hash(h: u64) -> (u64, u64) {
    let mut z = h.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    (h, z ^ (z >> 31))
}

/// FNV-1a.
struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    fn new() -> Self {
        Self {
            state: 0xcbf29ce484222325,
        }
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(0x100000001b3);
        }
    }
}
