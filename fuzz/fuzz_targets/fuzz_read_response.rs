#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_meter::codec::{decode_value, parse_read_response};
use voltage_meter::{ByteOrderMode, Encoding, ModbusPdu};

fuzz_target!(|data: &[u8]| {
    let Ok(pdu) = ModbusPdu::from_slice(data) else {
        return;
    };
    for expected in [1u16, 2] {
        if let Ok(payload) = parse_read_response(&pdu, expected) {
            assert_eq!(payload.len(), expected as usize * 2);
            let encoding = if expected == 1 { Encoding::Int16 } else { Encoding::Float32 };
            for mode in [ByteOrderMode::BigEndian, ByteOrderMode::LittleEndian, ByteOrderMode::WordSwap] {
                if let Ok(value) = decode_value(&payload, encoding, mode) {
                    assert!(value.is_finite());
                }
            }
        }
    }
});
