//! # Transport Layer
//!
//! Physical channels to the meter behind one [`Transport`] trait.
//!
//! ## Supported Transports
//!
//! ### Modbus TCP (`TcpTransport`)
//! - MBAP header with a rolling transaction id
//! - Connect timeout and per-exchange read timeout
//!
//! ### Modbus RTU (`RtuTransport`, feature `rtu`)
//! - Serial line via `tokio-serial`
//! - CRC-16/MODBUS, transmitted little-endian
//! - Responses read to the length announced in their header; the 3.5
//!   character gap only ends frames of unknown length
//!
//! Framing is done by the free functions in this module so it can be
//! exercised without a socket or a serial port.
//!
//! Any failure inside an exchange drops the underlying stream: after a
//! partial frame the position in the byte stream is unknown.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, MAX_MBAP_LENGTH, MAX_RTU_FRAME_SIZE, MBAP_HEADER_LEN,
};
use crate::error::{MeterError, MeterResult};
use crate::logging::log_packet;
use crate::pdu::ModbusPdu;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    fn record_failure(&mut self, err: &MeterError) {
        self.errors += 1;
        if matches!(err, MeterError::Timeout { .. }) {
            self.timeouts += 1;
        }
    }
}

/// A channel that carries one request/response exchange at a time.
///
/// Implementations must be `Send + Sync` so the connection manager can hold
/// them behind an async mutex shared with background tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel (TCP connect or serial port open).
    async fn open(&mut self) -> MeterResult<()>;

    /// Close the channel. Closing an already closed channel is a no-op.
    async fn close(&mut self) -> MeterResult<()>;

    /// Send one request PDU to `unit_id` and wait for its response PDU.
    ///
    /// Exception responses are returned as PDUs; interpreting them is up to
    /// the codec.
    async fn exchange(&mut self, unit_id: u8, request: &ModbusPdu) -> MeterResult<ModbusPdu>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Traffic counters.
    fn stats(&self) -> TransportStats;

    /// Endpoint description for status reporting, e.g. `tcp://10.0.0.5:502`.
    fn describe(&self) -> String;
}

// ============================================================================
// TCP Framing
// ============================================================================

/// Build an MBAP frame: transaction id, protocol id 0, length, unit id, PDU.
pub fn encode_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0x0000);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu.as_slice());
    frame
}

/// Validate an MBAP response frame and extract its PDU.
pub fn decode_tcp_frame(frame: &[u8], transaction_id: u16, unit_id: u8) -> MeterResult<ModbusPdu> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(MeterError::protocol(format!(
            "TCP frame too short: {} bytes",
            frame.len()
        )));
    }

    let tid = u16::from_be_bytes([frame[0], frame[1]]);
    if tid != transaction_id {
        return Err(MeterError::protocol(format!(
            "Transaction ID mismatch: expected {}, got {}",
            transaction_id, tid
        )));
    }

    let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
    if protocol_id != 0 {
        return Err(MeterError::protocol(format!(
            "Invalid protocol ID: {}",
            protocol_id
        )));
    }

    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if length != frame.len() - MBAP_HEADER_LEN {
        return Err(MeterError::protocol(format!(
            "MBAP length {} does not match frame ({} bytes after header)",
            length,
            frame.len() - MBAP_HEADER_LEN
        )));
    }

    if frame[MBAP_HEADER_LEN] != unit_id {
        return Err(MeterError::protocol(format!(
            "Unit ID mismatch: expected {}, got {}",
            unit_id, frame[MBAP_HEADER_LEN]
        )));
    }

    ModbusPdu::from_slice(&frame[MBAP_HEADER_LEN + 1..])
}

// ============================================================================
// RTU Framing
// ============================================================================

/// Build an RTU frame: unit id, PDU, CRC (little-endian).
pub fn encode_rtu_frame(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    let crc = CRC_MODBUS.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Verify CRC and unit id of an RTU frame and extract its PDU.
pub fn decode_rtu_frame(frame: &[u8], unit_id: u8) -> MeterResult<ModbusPdu> {
    if frame.len() < 4 {
        return Err(MeterError::protocol(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }

    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = CRC_MODBUS.checksum(&frame[..data_len]);
    if received != calculated {
        return Err(MeterError::protocol(format!(
            "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            calculated, received
        )));
    }

    if frame[0] != unit_id {
        return Err(MeterError::protocol(format!(
            "Unit ID mismatch: expected {}, got {}",
            unit_id, frame[0]
        )));
    }

    ModbusPdu::from_slice(&frame[1..data_len])
}

/// Minimum silence between RTU frames: 3.5 character times at 11 bits/char.
pub fn rtu_frame_gap(baud_rate: u32) -> Duration {
    let char_time_us = 11_000_000 / u64::from(baud_rate.max(1));
    Duration::from_micros(char_time_us * 35 / 10)
}

/// Full length of an RTU response given its first bytes.
///
/// Known for exception replies (5 bytes) and FC03 replies once the byte count
/// has arrived. `None` when more bytes are needed or the function is unknown.
pub fn expected_rtu_response_len(partial: &[u8]) -> Option<usize> {
    let function = *partial.get(1)?;
    if function & EXCEPTION_FLAG != 0 {
        return Some(5);
    }
    if function == FC_READ_HOLDING_REGISTERS {
        let byte_count = *partial.get(2)? as usize;
        return Some(3 + byte_count + 2);
    }
    None
}

/// Read one RTU response.
///
/// Reads until the length announced by the header has arrived, so a reply
/// split across USB-serial latency chunks is reassembled. Silence of one
/// frame gap only ends a frame whose length cannot be derived. The caller
/// bounds the whole read with its own timeout.
pub async fn read_rtu_response<R>(reader: &mut R, frame_gap: Duration) -> MeterResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut frame = Vec::with_capacity(MAX_RTU_FRAME_SIZE);
    let mut buffer = [0u8; MAX_RTU_FRAME_SIZE];

    loop {
        let expected = expected_rtu_response_len(&frame);
        if let Some(len) = expected {
            if frame.len() >= len {
                if frame.len() > len {
                    debug!("Discarding {} trailing bytes after RTU frame", frame.len() - len);
                    frame.truncate(len);
                }
                return Ok(frame);
            }
        }

        // Header incomplete or length known: wait for the rest. Otherwise the
        // function is unknown and silence marks the end.
        let n = if expected.is_some() || frame.len() < 3 {
            reader.read(&mut buffer).await?
        } else {
            match timeout(frame_gap, reader.read(&mut buffer)).await {
                Ok(read) => read?,
                Err(_) => return Ok(frame),
            }
        };

        if n == 0 {
            if frame.is_empty() {
                return Err(MeterError::transport("Serial port closed"));
            }
            return Ok(frame);
        }
        frame.extend_from_slice(&buffer[..n]);
        if frame.len() > MAX_RTU_FRAME_SIZE {
            return Err(MeterError::protocol("RTU frame too large"));
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

// ============================================================================
// TCP Transport
// ============================================================================

/// Modbus TCP transport
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    read_timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport {
    /// Create a closed TCP transport; call [`Transport::open`] to connect.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            connect_timeout,
            read_timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Get next transaction ID, skipping zero
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    async fn roundtrip(stream: &mut TcpStream, frame: &[u8]) -> MeterResult<Vec<u8>> {
        stream.write_all(frame).await?;

        // MBAP header plus unit id
        let mut header = [0u8; MBAP_HEADER_LEN + 1];
        stream.read_exact(&mut header).await?;

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(MeterError::protocol(format!(
                "Invalid MBAP length: {}",
                length
            )));
        }

        let mut response = vec![0u8; MBAP_HEADER_LEN + length];
        response[..header.len()].copy_from_slice(&header);
        stream.read_exact(&mut response[header.len()..]).await?;
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> MeterResult<()> {
        self.stream = None;
        let addr = format!("{}:{}", self.host, self.port);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(MeterError::transport(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(MeterError::timeout(
                    format!("connect to {}", addr),
                    millis(self.connect_timeout),
                ))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        info!("Modbus TCP connected to {}", addr);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> MeterResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("Modbus TCP connection to {}:{} closed", self.host, self.port);
        }
        Ok(())
    }

    async fn exchange(&mut self, unit_id: u8, request: &ModbusPdu) -> MeterResult<ModbusPdu> {
        let transaction_id = self.next_transaction_id();
        let frame = encode_tcp_frame(transaction_id, unit_id, request);
        let read_timeout = self.read_timeout;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MeterError::transport("TCP stream not open"))?;

        if self.packet_logging {
            log_packet("send", "TCP", unit_id, &frame);
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let result = match timeout(read_timeout, Self::roundtrip(stream, &frame)).await {
            Ok(result) => result,
            Err(_) => Err(MeterError::timeout("read response", millis(read_timeout))),
        };

        let response = match result.and_then(|r| {
            let pdu = decode_tcp_frame(&r, transaction_id, unit_id)?;
            Ok((r, pdu))
        }) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("Modbus TCP exchange failed, dropping stream: {}", e);
                self.stats.record_failure(&e);
                self.stream = None;
                return Err(e);
            }
        };

        let (raw, pdu) = response;
        self.stats.responses_received += 1;
        self.stats.bytes_received += raw.len() as u64;
        if self.packet_logging {
            log_packet("receive", "TCP", unit_id, &raw);
        }
        Ok(pdu)
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

// ============================================================================
// RTU Transport
// ============================================================================

#[cfg(feature = "rtu")]
pub use self::rtu::RtuTransport;

#[cfg(feature = "rtu")]
mod rtu {
    use super::*;

    use tokio_serial::{DataBits, SerialPortBuilderExt, SerialStream, StopBits};

    use crate::config::{Parity, SerialConfig};

    /// Modbus RTU transport over a serial line
    pub struct RtuTransport {
        port: Option<SerialStream>,
        path: String,
        baud_rate: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: tokio_serial::Parity,
        read_timeout: Duration,
        /// Minimum time between frames
        frame_gap: Duration,
        stats: TransportStats,
        packet_logging: bool,
    }

    impl RtuTransport {
        /// Create a closed RTU transport from serial settings.
        pub fn new(config: &SerialConfig, read_timeout: Duration) -> MeterResult<Self> {
            let data_bits = match config.data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                8 => DataBits::Eight,
                other => {
                    return Err(MeterError::configuration(format!(
                        "Unsupported data bits: {}",
                        other
                    )))
                }
            };
            let stop_bits = match config.stop_bits {
                1 => StopBits::One,
                2 => StopBits::Two,
                other => {
                    return Err(MeterError::configuration(format!(
                        "Unsupported stop bits: {}",
                        other
                    )))
                }
            };
            let parity = match config.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            };

            Ok(Self {
                port: None,
                path: config.path.clone(),
                baud_rate: config.baud_rate,
                data_bits,
                stop_bits,
                parity,
                read_timeout,
                frame_gap: rtu_frame_gap(config.baud_rate),
                stats: TransportStats::default(),
                packet_logging: false,
            })
        }

        /// Enable or disable packet logging
        pub fn with_packet_logging(mut self, enabled: bool) -> Self {
            self.packet_logging = enabled;
            self
        }

        async fn roundtrip(
            port: &mut SerialStream,
            frame: &[u8],
            frame_gap: Duration,
        ) -> MeterResult<Vec<u8>> {
            tokio::time::sleep(frame_gap).await;
            port.write_all(frame).await?;
            port.flush().await?;
            read_rtu_response(port, frame_gap).await
        }
    }

    #[async_trait]
    impl Transport for RtuTransport {
        async fn open(&mut self) -> MeterResult<()> {
            self.port = None;
            let port = tokio_serial::new(&self.path, self.baud_rate)
                .data_bits(self.data_bits)
                .stop_bits(self.stop_bits)
                .parity(self.parity)
                .timeout(self.read_timeout)
                .open_native_async()
                .map_err(|e| {
                    MeterError::transport(format!(
                        "Failed to open serial port {}: {}",
                        self.path, e
                    ))
                })?;

            info!(
                "Modbus RTU port {} opened at {} baud",
                self.path, self.baud_rate
            );
            self.port = Some(port);
            Ok(())
        }

        async fn close(&mut self) -> MeterResult<()> {
            if self.port.take().is_some() {
                info!("Modbus RTU port {} closed", self.path);
            }
            Ok(())
        }

        async fn exchange(&mut self, unit_id: u8, request: &ModbusPdu) -> MeterResult<ModbusPdu> {
            let frame = encode_rtu_frame(unit_id, request);
            let read_timeout = self.read_timeout;
            let frame_gap = self.frame_gap;

            let port = self
                .port
                .as_mut()
                .ok_or_else(|| MeterError::transport("Serial port not open"))?;

            if self.packet_logging {
                log_packet("send", "RTU", unit_id, &frame);
            }
            self.stats.requests_sent += 1;
            self.stats.bytes_sent += frame.len() as u64;

            let result = match timeout(read_timeout, Self::roundtrip(port, &frame, frame_gap)).await {
                Ok(result) => result,
                Err(_) => Err(MeterError::timeout(
                    "read response",
                    millis(read_timeout),
                )),
            };

            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Modbus RTU exchange failed, dropping port: {}", e);
                    self.stats.record_failure(&e);
                    self.port = None;
                    return Err(e);
                }
            };

            self.stats.bytes_received += raw.len() as u64;
            if self.packet_logging {
                log_packet("receive", "RTU", unit_id, &raw);
            }

            match decode_rtu_frame(&raw, unit_id) {
                Ok(pdu) => {
                    self.stats.responses_received += 1;
                    Ok(pdu)
                }
                Err(e) => {
                    self.stats.record_failure(&e);
                    self.port = None;
                    Err(e)
                }
            }
        }

        fn is_open(&self) -> bool {
            self.port.is_some()
        }

        fn stats(&self) -> TransportStats {
            self.stats.clone()
        }

        fn describe(&self) -> String {
            format!("rtu://{}@{}", self.path, self.baud_rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduBuilder;
    use tokio::net::TcpListener;

    #[test]
    fn test_crc_calculation() {
        // Known frame: read 10 holding registers from slave 1 at address 0
        let frame = encode_rtu_frame(1, &PduBuilder::build_read_holding(0, 10).unwrap());
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn test_decode_rtu_frame() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x43, 0x66, 0x80, 0x00]).unwrap();
        let frame = encode_rtu_frame(1, &pdu);
        assert_eq!(decode_rtu_frame(&frame, 1).unwrap(), pdu);

        let mut corrupted = frame.clone();
        corrupted[3] ^= 0xFF;
        assert!(matches!(
            decode_rtu_frame(&corrupted, 1),
            Err(MeterError::Protocol { .. })
        ));

        assert!(matches!(
            decode_rtu_frame(&frame, 2),
            Err(MeterError::Protocol { .. })
        ));
        assert!(decode_rtu_frame(&[0x01, 0x03, 0x00], 1).is_err());
    }

    #[test]
    fn test_tcp_frame_roundtrip() {
        let pdu = PduBuilder::build_read_holding(4608, 2).unwrap();
        let frame = encode_tcp_frame(0x0102, 1, &pdu);
        assert_eq!(
            &frame[..],
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x12, 0x00, 0x00, 0x02]
        );
        assert_eq!(decode_tcp_frame(&frame, 0x0102, 1).unwrap(), pdu);
    }

    #[test]
    fn test_decode_tcp_frame_mismatches() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        let frame = encode_tcp_frame(7, 1, &pdu);
        assert!(decode_tcp_frame(&frame, 8, 1).is_err());
        assert!(decode_tcp_frame(&frame, 7, 2).is_err());
        assert!(decode_tcp_frame(&frame[..7], 7, 1).is_err());
        assert!(decode_tcp_frame(&frame, 7, 1).unwrap().is_exception());
    }

    #[test]
    fn test_frame_gap() {
        // 9600 baud: 1145 us per char, 4007 us gap
        assert_eq!(rtu_frame_gap(9600), Duration::from_micros(4007));
        assert!(rtu_frame_gap(115_200) < rtu_frame_gap(9600));
    }

    #[test]
    fn test_expected_rtu_response_len() {
        assert_eq!(expected_rtu_response_len(&[0x01]), None);
        assert_eq!(expected_rtu_response_len(&[0x01, 0x03]), None);
        assert_eq!(expected_rtu_response_len(&[0x01, 0x03, 0x04]), Some(9));
        assert_eq!(expected_rtu_response_len(&[0x01, 0x83]), Some(5));
        assert_eq!(expected_rtu_response_len(&[0x01, 0x04, 0x02]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_response_split_across_chunks() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x43, 0x66, 0x80, 0x00]).unwrap();
        let frame = encode_rtu_frame(1, &pdu);

        // USB-serial adapters flush on a ~16ms latency timer, well past the 4ms gap
        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..5])
            .wait(Duration::from_millis(16))
            .read(&frame[5..])
            .build();

        let raw = read_rtu_response(&mut reader, rtu_frame_gap(9600)).await.unwrap();
        assert_eq!(raw, frame);
        assert_eq!(decode_rtu_frame(&raw, 1).unwrap(), pdu);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_exception_split_after_unit_id() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        let frame = encode_rtu_frame(1, &pdu);

        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..1])
            .wait(Duration::from_millis(16))
            .read(&frame[1..3])
            .wait(Duration::from_millis(16))
            .read(&frame[3..])
            .build();

        let raw = read_rtu_response(&mut reader, rtu_frame_gap(9600)).await.unwrap();
        assert!(decode_rtu_frame(&raw, 1).unwrap().is_exception());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_unknown_function_ends_on_silence() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0x01, 0x04, 0x02, 0x00])
            .wait(Duration::from_millis(16))
            .build();

        let raw = read_rtu_response(&mut reader, rtu_frame_gap(9600)).await.unwrap();
        assert_eq!(raw, vec![0x01, 0x04, 0x02, 0x00]);
    }

    async fn spawn_device(reply: Option<Vec<u8>>) -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            socket.read_exact(&mut request).await.unwrap();
            match reply {
                Some(pdu) => {
                    let pdu = ModbusPdu::from_slice(&pdu).unwrap();
                    let tid = u16::from_be_bytes([request[0], request[1]]);
                    let frame = encode_tcp_frame(tid, request[6], &pdu);
                    socket.write_all(&frame).await.unwrap();
                }
                None => {
                    // Never answer
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_tcp_exchange_with_device() {
        let (port, device) = spawn_device(Some(vec![0x03, 0x04, 0x43, 0x66, 0x80, 0x00])).await;

        let mut transport = TcpTransport::new(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(!transport.is_open());
        transport.open().await.unwrap();
        assert!(transport.is_open());

        let request = PduBuilder::build_read_holding(4608, 2).unwrap();
        let response = transport.exchange(1, &request).await.unwrap();
        assert_eq!(response.as_slice(), &[0x03, 0x04, 0x43, 0x66, 0x80, 0x00]);

        let stats = transport.stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_sent, 12);
        assert_eq!(stats.bytes_received, 13);

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_read_timeout_drops_stream() {
        let (port, device) = spawn_device(None).await;

        let mut transport = TcpTransport::new(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_millis(100),
        );
        transport.open().await.unwrap();

        let request = PduBuilder::build_read_holding(0, 2).unwrap();
        let err = transport.exchange(1, &request).await.unwrap_err();
        assert!(matches!(err, MeterError::Timeout { .. }));
        assert!(err.is_link_failure());
        assert!(!transport.is_open());
        assert_eq!(transport.stats().timeouts, 1);
        device.abort();
    }

    #[tokio::test]
    async fn test_tcp_exchange_when_closed() {
        let mut transport =
            TcpTransport::new("127.0.0.1", 1, Duration::from_secs(1), Duration::from_secs(1));
        let request = PduBuilder::build_read_holding(0, 2).unwrap();
        assert!(matches!(
            transport.exchange(1, &request).await,
            Err(MeterError::Transport { .. })
        ));
        assert_eq!(transport.describe(), "tcp://127.0.0.1:1");
    }
}
