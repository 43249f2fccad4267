//! Fuzz target for membership packet decoding.
//!
//! Any input must either decode or be rejected without panicking. Whatever
//! decodes must re-encode to a packet that decodes to the same message.

#![no_main]

use libfuzzer_sys::fuzz_target;
use memberlist_kv::message::Message;

fuzz_target!(|data: &[u8]| {
    let Some(msg) = Message::decode_from_slice(data) else {
        return;
    };

    let encoded = msg.encode_to_bytes();
    assert_eq!(encoded.len(), msg.encoded_len());
    let again = Message::decode_from_slice(&encoded).expect("re-encoded message must decode");
    assert_eq!(again, msg);

    // Compound parts are decoded one level deep by the packet handler.
    if let Message::Compound(parts) = msg {
        for part in parts {
            let _ = Message::decode_from_slice(&part);
        }
    }
});
