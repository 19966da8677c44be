//! Property-based tests for the record filter, the wire formats and the
//! transfer protocols.

mod common;

use proptest::prelude::*;
use vxfer_transport::record::{decode, encode, filter, wire_len};
use vxfer_transport::{FilterPolicy, Record, TransferMode, RECORD_SIZE};

fn any_record() -> impl Strategy<Value = Record> {
    (0u32..4, any::<u32>(), any::<u64>()).prop_map(|(key, seq, value)| Record::new(key, seq, value))
}

fn any_records(max: usize) -> impl Strategy<Value = Vec<Record>> {
    proptest::collection::vec(any_record(), 0..max)
}

fn any_mode() -> impl Strategy<Value = TransferMode> {
    prop_oneof![
        Just(TransferMode::Send),
        Just(TransferMode::Write),
        Just(TransferMode::Read)
    ]
}

proptest! {
    #[test]
    fn prop_filter_idempotent(records in any_records(64), key in 0u32..4) {
        let once = filter(&records, key);
        prop_assert_eq!(filter(&once, key), once);
    }

    #[test]
    fn prop_filter_preserves_order_and_matches(records in any_records(64), key in 0u32..4) {
        let kept = filter(&records, key);
        prop_assert!(kept.iter().all(|r| r.key == key));
        prop_assert_eq!(kept.len(), records.iter().filter(|r| r.key == key).count());

        // Kept records appear in the input in the same relative order.
        let mut rest = records.iter();
        for r in &kept {
            prop_assert!(rest.any(|x| x == r));
        }
    }

    #[test]
    fn prop_encoded_length_is_record_multiple(records in any_records(64)) {
        let bytes = encode(&records).unwrap();
        prop_assert_eq!(bytes.len(), records.len() * RECORD_SIZE);
        prop_assert_eq!(bytes.len(), wire_len(records.len()));
        prop_assert_eq!(decode(&bytes).unwrap(), records);
    }

    #[test]
    fn prop_misaligned_payload_rejected(len in 1usize..200) {
        prop_assume!(len % RECORD_SIZE != 0);
        prop_assert!(decode(&vec![0u8; len]).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_transfer_moves_exactly_the_filtered_records(
        records in any_records(40),
        key in 0u32..4,
        mode in any_mode(),
    ) {
        let (server, client) = common::run_transfer(
            mode,
            FilterPolicy::AtServer { key },
            records.clone(),
            records.len(),
        );
        let expected = filter(&records, key);
        let server = server.unwrap();
        let client = client.unwrap();
        prop_assert_eq!(server.records_moved, expected.len());
        prop_assert_eq!(client.stats.bytes_moved, wire_len(expected.len()) as u64);
        prop_assert_eq!(client.records, expected);
    }
}
