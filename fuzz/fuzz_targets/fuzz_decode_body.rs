//! Fuzz target for stored body decoding.
//!
//! `decode_body` must return an error, never panic, on arbitrary bytes
//! (including payloads that start with the zstd frame magic).

#![no_main]

use docsync::codec::decode_body;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode_body(data);
});
