#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_meter::transport::{decode_rtu_frame, encode_rtu_frame};

fuzz_target!(|data: &[u8]| {
    if let Ok(pdu) = decode_rtu_frame(data, 1) {
        // A frame that decodes re-encodes to the same bytes
        assert_eq!(encode_rtu_frame(1, &pdu), data);
    }
});
