//! Fuzz target for key-value gossip and anti-entropy payloads.
//!
//! Malformed payloads must be rejected without touching the store.

#![no_main]

use libfuzzer_sys::fuzz_target;
use memberlist_kv::kv::{GossipMessage, Store};

fuzz_target!(|data: &[u8]| {
    let store = Store::new();
    if let Ok(msg) = GossipMessage::decode(data) {
        store.apply_updates(msg.updates());
        // Valid messages survive a re-encode.
        let encoded = msg.encode().expect("re-encode");
        assert_eq!(GossipMessage::decode(&encoded).ok(), Some(msg));
    }

    let before = store.snapshot();
    if store.merge_remote_state(data).is_err() {
        assert_eq!(store.snapshot(), before);
    }
});
