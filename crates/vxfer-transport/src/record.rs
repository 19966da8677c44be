//! Fixed-layout records, the record filter and the deterministic generator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Wire size of one record.
pub const RECORD_SIZE: usize = 16;

/// One record. Serialized little-endian, fixed width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    /// Discriminating key the filter selects on.
    pub key: u32,
    /// Position in the generated set.
    pub seq: u32,
    /// Payload.
    pub value: u64,
}

impl Record {
    /// Creates a record.
    pub fn new(key: u32, seq: u32, value: u64) -> Self {
        Self { key, seq, value }
    }
}

/// Returns the records whose key equals `key`, in their original order.
pub fn filter(records: &[Record], key: u32) -> Vec<Record> {
    records.iter().filter(|r| r.key == key).copied().collect()
}

/// Generates `count` records with keys drawn uniformly from `0..key_space`.
/// The same seed always yields the same set.
pub fn generate(count: usize, key_space: u32, seed: u64) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(seed);
    let key_space = key_space.max(1);
    (0..count)
        .map(|seq| Record {
            key: rng.gen_range(0..key_space),
            seq: seq as u32,
            value: rng.gen(),
        })
        .collect()
}

/// Byte length of `count` records on the wire.
pub fn wire_len(count: usize) -> usize {
    count * RECORD_SIZE
}

/// Byte length of `count` records, or `None` when it does not fit a single
/// transport operation.
pub fn checked_wire_len(count: usize) -> Option<usize> {
    count
        .checked_mul(RECORD_SIZE)
        .filter(|&len| u32::try_from(len).is_ok())
}

/// Serializes records back to back.
pub fn encode(records: &[Record]) -> Result<Vec<u8>, TransferError> {
    let mut buf = Vec::with_capacity(wire_len(records.len()));
    for record in records {
        bincode::serialize_into(&mut buf, record)?;
    }
    Ok(buf)
}

/// Deserializes a payload produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Vec<Record>, TransferError> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(TransferError::MisalignedPayload {
            len: bytes.len(),
            record_size: RECORD_SIZE,
        });
    }
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| bincode::deserialize(chunk).map_err(TransferError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(keys: &[u32]) -> Vec<Record> {
        keys.iter()
            .enumerate()
            .map(|(i, &key)| Record::new(key, i as u32 + 1, (i as u64 + 1) * 100))
            .collect()
    }

    #[test]
    fn test_record_wire_size() {
        let bytes = encode(&[Record::new(1, 2, 3)]).unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(&bytes[..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..], &3u64.to_le_bytes());
    }

    #[test]
    fn test_filter_selects_matching_keys_in_order() {
        let records = keyed(&[1, 2, 1, 3, 1]);
        let kept = filter(&records, 1);
        let seqs: Vec<u32> = kept.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 3, 5]);
        assert_eq!(wire_len(kept.len()), 48);
    }

    #[test]
    fn test_filter_no_match() {
        assert!(filter(&keyed(&[2, 3, 2]), 1).is_empty());
        assert!(filter(&[], 1).is_empty());
    }

    #[test]
    fn test_filter_keeps_duplicates() {
        let r = Record::new(4, 0, 9);
        assert_eq!(filter(&[r, r, r], 4), vec![r, r, r]);
    }

    #[test]
    fn test_generate_deterministic() {
        let a = generate(100, 3, 7);
        let b = generate(100, 3, 7);
        assert_eq!(a, b);
        assert_ne!(a, generate(100, 3, 8));
        assert!(a.iter().all(|r| r.key < 3));
        assert!(a.iter().enumerate().all(|(i, r)| r.seq == i as u32));
    }

    #[test]
    fn test_generate_zero_key_space() {
        assert!(generate(10, 0, 1).iter().all(|r| r.key == 0));
    }

    #[test]
    fn test_checked_wire_len_limit() {
        let max = u32::MAX as usize / RECORD_SIZE;
        assert_eq!(checked_wire_len(3), Some(48));
        assert_eq!(checked_wire_len(max), Some(max * RECORD_SIZE));
        assert_eq!(checked_wire_len(max + 1), None);
        assert_eq!(checked_wire_len(usize::MAX), None);
    }

    #[test]
    fn test_decode_misaligned() {
        assert!(matches!(
            decode(&[0u8; 17]),
            Err(TransferError::MisalignedPayload { len: 17, record_size: 16 })
        ));
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_encoded_set() {
        let records = generate(33, 5, 1);
        assert_eq!(decode(&encode(&records).unwrap()).unwrap(), records);
    }
}
