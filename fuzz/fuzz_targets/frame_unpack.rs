//! Fuzz target for frame decoding
//!
//! Unpacking arbitrary bytes must never panic, and anything that decodes must
//! pack back to the bytes it came from.

#![no_main]

use busseal_core::{FrameCodec, HeaderType};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for header_type in [HeaderType::Compact, HeaderType::Extended] {
        let codec = FrameCodec::new(header_type);
        if let Ok(pdu) = codec.unpack(data) {
            let packed = codec.pack(&pdu).expect("decoded pdu packs");
            assert_eq!(packed[..], data[..packed.len()]);
        }
    }
});
