//! Fuzz target for envelope decoding and message normalization
//!
//! Arbitrary bytes are decoded as an envelope and, separately, as a bare JSON
//! value fed to the normalizer.
//!
//! # Invariants
//!
//! - Decoding NEVER panics; malformed input is an error
//! - Normalization accepts any JSON value and yields a confirmed message

#![no_main]

use libfuzzer_sys::fuzz_target;
use roomsync_core::{Envelope, Timestamp, UserId, normalize_value};

const NOW: Timestamp = Timestamp(1_704_067_200_000);

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(envelope) = Envelope::from_json(text) {
        let msg = normalize_value(envelope.data, &UserId::from("me"), NOW);
        assert!(!msg.is_temp);
    }

    if let Ok(value) = serde_json::from_str(text) {
        let msg = normalize_value(value, &UserId::from("me"), NOW);
        assert!(!msg.is_temp);
        assert!(!msg.send_failed);
    }
});
