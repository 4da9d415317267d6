#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_meter::transport::decode_tcp_frame;

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    let _ = decode_tcp_frame(&data[2..], transaction_id, 1);
});
