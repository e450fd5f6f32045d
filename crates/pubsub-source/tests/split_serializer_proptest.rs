//! Property tests for split persistence.

use proptest::prelude::*;
use pubsub_source::{SubscriptionSplit, SubscriptionSplitSerializer};

proptest! {
    #[test]
    fn prop_split_round_trips(
        project in "[a-z][a-z0-9-]{0,29}",
        subscription in "\\PC{1,40}",
        key in proptest::option::of("\\PC{0,16}"),
    ) {
        let mut split = SubscriptionSplit::new(project, subscription);
        if let Some(key) = key {
            split = split.with_ordering_key(key);
        }
        let serializer = SubscriptionSplitSerializer;

        let bytes = serializer.serialize(&split).unwrap();
        prop_assert_eq!(serializer.deserialize(serializer.version(), &bytes).unwrap(), split.clone());

        let envelope = serializer.serialize_versioned(&split).unwrap();
        prop_assert_eq!(serializer.deserialize_versioned(&envelope).unwrap(), split);
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let serializer = SubscriptionSplitSerializer;
        if let Ok(split) = serializer.deserialize(serializer.version(), &bytes) {
            prop_assert!(split.validate().is_ok());
        }
    }

    #[test]
    fn prop_huge_length_prefix_is_decode_error(
        marker in 251u8..=253,
        len_bytes in prop::collection::vec(0x80u8..=0xff, 8),
        tail in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let mut bytes = vec![marker];
        bytes.extend(len_bytes);
        bytes.extend(tail);
        let serializer = SubscriptionSplitSerializer;
        prop_assert!(serializer.deserialize(serializer.version(), &bytes).is_err());
    }
}
