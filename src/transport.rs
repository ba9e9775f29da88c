//! Half-duplex RTU transport
//!
//! [`RtuTransport`] owns a [`SerialLine`] and a [`TransceiverControl`] and
//! performs one send or one receive at a time:
//!
//! ```text
//! send:    wait 3.5 chars ─► DE on ─► flush RX ─► write ─► wait TX done ─► DE off
//! receive: read until deadline, buffer full, or 3.5 chars of silence ─► CRC check
//! ```
//!
//! Lines and direction drivers are traits so the same transport runs against
//! a real UART, the in-process [`crate::sim::SimulatedBus`] or a test script.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{frame_gap, MAX_FRAME_LEN, MIN_FRAME_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{crc16, hex, validate_crc};

/// Byte-level access to a serial line
pub trait SerialLine: Send {
    /// Discard any bytes already waiting in the receive buffer
    fn clear_input(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write bytes, returning how many were accepted
    fn write(&mut self, data: &[u8]) -> impl Future<Output = ModbusResult<usize>> + Send;

    /// Wait until the UART has shifted out everything written
    fn wait_tx_done(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Read whatever is available, waiting until at least one byte arrives.
    /// Returns 0 when the line is closed.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = ModbusResult<usize>> + Send;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;
}

/// Drives the DE/RE lines of an RS-485 transceiver
pub trait TransceiverControl: Send {
    fn set_transmit(&mut self) -> ModbusResult<()>;

    fn set_receive(&mut self) -> ModbusResult<()>;

    /// Return the pins to a passive state and free them
    fn release(&mut self) -> ModbusResult<()>;
}

/// Transceivers with automatic direction switching
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDirection;

impl TransceiverControl for AutoDirection {
    fn set_transmit(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    fn set_receive(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    fn release(&mut self) -> ModbusResult<()> {
        Ok(())
    }
}

/// DE/RE control through the Linux sysfs GPIO interface
///
/// DE is active high, RE is active low: transmit drives both high, receive
/// drives both low.
#[derive(Debug)]
pub struct GpioTransceiver {
    root: PathBuf,
    de_pin: u32,
    re_pin: u32,
}

impl GpioTransceiver {
    pub fn new(de_pin: u32, re_pin: u32) -> ModbusResult<Self> {
        Self::with_root("/sys/class/gpio", de_pin, re_pin)
    }

    /// Use a different sysfs root, mainly for tests
    pub fn with_root<P: Into<PathBuf>>(root: P, de_pin: u32, re_pin: u32) -> ModbusResult<Self> {
        if de_pin == re_pin {
            return Err(ModbusError::invalid_argument(format!(
                "DE and RE must be different pins, both are gpio{}",
                de_pin
            )));
        }
        let mut gpio = Self {
            root: root.into(),
            de_pin,
            re_pin,
        };
        for pin in [de_pin, re_pin] {
            gpio.export(pin)?;
        }
        gpio.set_receive()?;
        debug!("RS-485 direction pins ready: DE={} RE={}", de_pin, re_pin);
        Ok(gpio)
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn export(&mut self, pin: u32) -> ModbusResult<()> {
        if !self.pin_dir(pin).exists() {
            std::fs::write(self.root.join("export"), pin.to_string())
                .map_err(|e| ModbusError::transport(format!("export gpio{}: {}", pin, e)))?;
        }
        std::fs::write(self.pin_dir(pin).join("direction"), "out")
            .map_err(|e| ModbusError::transport(format!("configure gpio{}: {}", pin, e)))
    }

    fn write_level(&self, pin: u32, high: bool) -> ModbusResult<()> {
        std::fs::write(
            self.pin_dir(pin).join("value"),
            if high { "1" } else { "0" },
        )
        .map_err(|e| ModbusError::transport(format!("drive gpio{}: {}", pin, e)))
    }
}

impl TransceiverControl for GpioTransceiver {
    fn set_transmit(&mut self) -> ModbusResult<()> {
        self.write_level(self.de_pin, true)?;
        self.write_level(self.re_pin, true)
    }

    fn set_receive(&mut self) -> ModbusResult<()> {
        self.write_level(self.de_pin, false)?;
        self.write_level(self.re_pin, false)
    }

    fn release(&mut self) -> ModbusResult<()> {
        self.set_receive()?;
        for pin in [self.de_pin, self.re_pin] {
            if let Err(e) = std::fs::write(self.root.join("unexport"), pin.to_string()) {
                warn!("Failed to unexport gpio{}: {}", pin, e);
            }
        }
        Ok(())
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub crc_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One half-duplex RTU line with its direction control
pub struct RtuTransport<L, D = AutoDirection> {
    line: L,
    direction: D,
    frame_gap: Duration,
    tx_done_timeout: Duration,
    last_activity: Option<Instant>,
    stats: TransportStats,
}

impl<L: SerialLine, D: TransceiverControl> RtuTransport<L, D> {
    /// Create a transport; the transceiver is put into receive mode.
    pub fn new(line: L, mut direction: D, baud_rate: u32) -> ModbusResult<Self> {
        direction.set_receive()?;
        Ok(Self {
            line,
            direction,
            frame_gap: frame_gap(baud_rate),
            tx_done_timeout: crate::constants::DEFAULT_TX_DONE_TIMEOUT,
            last_activity: None,
            stats: TransportStats::default(),
        })
    }

    pub fn with_frame_gap(mut self, gap: Duration) -> Self {
        self.frame_gap = gap;
        self
    }

    pub fn with_tx_done_timeout(mut self, timeout: Duration) -> Self {
        self.tx_done_timeout = timeout;
        self
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Keep the inter-frame silence after the previous frame on the line
    async fn wait_frame_gap(&mut self) {
        if let Some(until) = self.last_activity.map(|last| last + self.frame_gap) {
            tokio::time::sleep_until(until).await;
        }
    }

    /// Transmit one complete frame.
    ///
    /// The transceiver is back in receive mode when this returns, on success
    /// and on failure.
    pub async fn send(&mut self, frame: &[u8]) -> ModbusResult<()> {
        self.wait_frame_gap().await;

        if let Err(e) = self.direction.set_transmit() {
            self.stats.errors += 1;
            return Err(e);
        }
        let result = self.transmit(frame).await;
        let restored = self.direction.set_receive();
        self.last_activity = Some(Instant::now());

        match (result, restored) {
            (Ok(()), Ok(())) => {
                self.stats.requests_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                debug!("[MODBUS-RTU] TX {}", hex(frame));
                Ok(())
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                self.stats.errors += 1;
                Err(e)
            }
        }
    }

    async fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()> {
        self.line.clear_input().await?;
        let written = self.line.write(frame).await?;
        if written != frame.len() {
            return Err(ModbusError::transport(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        if let Err(e) = self.line.wait_tx_done(self.tx_done_timeout).await {
            warn!("TX completion not confirmed: {}", e);
        }
        Ok(())
    }

    /// Receive one frame, waiting at most `timeout` for it to complete.
    pub async fn receive(&mut self, timeout: Duration) -> ModbusResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_FRAME_LEN];
        let mut len = 0;

        while len < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            // After the first byte, silence of one frame gap ends the frame
            let wait = if len == 0 {
                remaining
            } else {
                remaining.min(self.frame_gap)
            };
            match tokio::time::timeout(wait, self.line.read(&mut buf[len..])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => len += n,
                Ok(Err(e)) => {
                    self.stats.errors += 1;
                    return Err(e);
                }
                Err(_) => break,
            }
        }
        self.last_activity = Some(Instant::now());

        let frame = &buf[..len];
        if len < MIN_FRAME_LEN {
            self.stats.timeouts += 1;
            if len > 0 {
                debug!("[MODBUS-RTU] RX fragment {}", hex(frame));
            }
            return Err(ModbusError::timeout(
                "receive",
                timeout.as_millis() as u64,
            ));
        }

        self.stats.bytes_received += len as u64;
        debug!("[MODBUS-RTU] RX {}", hex(frame));

        if !validate_crc(frame) {
            self.stats.crc_errors += 1;
            let split = len - 2;
            return Err(ModbusError::CrcError {
                expected: crc16(&frame[..split]),
                actual: u16::from_le_bytes([frame[split], frame[split + 1]]),
            });
        }

        self.stats.responses_received += 1;
        Ok(frame.to_vec())
    }

    /// Close the line and release the direction pins
    pub async fn close(&mut self) -> ModbusResult<()> {
        let closed = self.line.close().await;
        let released = self.direction.release();
        closed.and(released)
    }
}

#[cfg(feature = "rtu")]
pub use serial::TokioSerialLine;

#[cfg(feature = "rtu")]
mod serial {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
    use tracing::info;

    use super::SerialLine;
    use crate::error::{ModbusError, ModbusResult};

    /// UART backed by `tokio-serial`, fixed to 8N1
    pub struct TokioSerialLine {
        stream: SerialStream,
        port_name: String,
    }

    impl TokioSerialLine {
        pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> ModbusResult<Self> {
            let stream = tokio_serial::new(port, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .stop_bits(tokio_serial::StopBits::One)
                .parity(tokio_serial::Parity::None)
                .timeout(timeout)
                .open_native_async()
                .map_err(|e| {
                    ModbusError::transport(format!("Failed to open serial port {}: {}", port, e))
                })?;
            info!("Serial port {} opened at {} baud (8N1)", port, baud_rate);
            Ok(Self {
                stream,
                port_name: port.to_string(),
            })
        }

        pub fn port_name(&self) -> &str {
            &self.port_name
        }
    }

    impl SerialLine for TokioSerialLine {
        async fn clear_input(&mut self) -> ModbusResult<()> {
            self.stream
                .clear(tokio_serial::ClearBuffer::Input)
                .map_err(|e| ModbusError::transport(format!("flush RX: {}", e)))
        }

        async fn write(&mut self, data: &[u8]) -> ModbusResult<usize> {
            self.stream.write_all(data).await?;
            Ok(data.len())
        }

        async fn wait_tx_done(&mut self, timeout: Duration) -> ModbusResult<()> {
            tokio::time::timeout(timeout, self.stream.flush())
                .await
                .map_err(|_| ModbusError::timeout("TX drain", timeout.as_millis() as u64))??;
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
            Ok(self.stream.read(buf).await?)
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.stream.shutdown().await?;
            info!("Serial port {} closed", self.port_name);
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// What a scripted line does for one request
    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        /// Deliver these bytes in one read
        Frame(Vec<u8>),
        /// Never answer
        Silence,
    }

    /// Test line that answers each write with the next scripted reply
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedLine {
        pub replies: Arc<Mutex<VecDeque<Reply>>>,
        pub written: Arc<Mutex<Vec<Vec<u8>>>>,
        pub pending: Vec<u8>,
        pub short_write: bool,
    }

    impl ScriptedLine {
        pub fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                ..Default::default()
            }
        }

        pub fn writes(&self) -> usize {
            self.written.lock().unwrap().len()
        }
    }

    impl SerialLine for ScriptedLine {
        async fn clear_input(&mut self) -> ModbusResult<()> {
            self.pending.clear();
            Ok(())
        }

        async fn write(&mut self, data: &[u8]) -> ModbusResult<usize> {
            self.written.lock().unwrap().push(data.to_vec());
            if self.short_write {
                return Ok(data.len() / 2);
            }
            let reply = self.replies.lock().unwrap().pop_front();
            if let Some(Reply::Frame(bytes)) = reply {
                self.pending = bytes;
            }
            Ok(data.len())
        }

        async fn wait_tx_done(&mut self, _timeout: Duration) -> ModbusResult<()> {
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
            if self.pending.is_empty() {
                std::future::pending::<()>().await;
            }
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        async fn close(&mut self) -> ModbusResult<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingDirection {
        pub events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl TransceiverControl for RecordingDirection {
        fn set_transmit(&mut self) -> ModbusResult<()> {
            self.events.lock().unwrap().push("tx");
            Ok(())
        }

        fn set_receive(&mut self) -> ModbusResult<()> {
            self.events.lock().unwrap().push("rx");
            Ok(())
        }

        fn release(&mut self) -> ModbusResult<()> {
            self.events.lock().unwrap().push("release");
            Ok(())
        }
    }

    pub(crate) fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_then_receive() {
        let reply = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let line = ScriptedLine::new(vec![Reply::Frame(reply.clone())]);
        let direction = RecordingDirection::default();
        let mut transport = RtuTransport::new(line.clone(), direction.clone(), 9600).unwrap();

        transport.send(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]).await.unwrap();
        let frame = transport.receive(Duration::from_millis(1000)).await.unwrap();

        assert_eq!(frame, reply);
        assert_eq!(line.writes(), 1);
        assert_eq!(*direction.events.lock().unwrap(), vec!["rx", "tx", "rx"]);
        assert_eq!(transport.stats().requests_sent, 1);
        assert_eq!(transport.stats().responses_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout_on_silence() {
        let line = ScriptedLine::new(vec![Reply::Silence]);
        let mut transport = RtuTransport::new(line, AutoDirection, 9600).unwrap();
        transport.send(&[0x01, 0x03]).await.unwrap();

        let started = Instant::now();
        let err = transport.receive(Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { timeout_ms: 500, .. }));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(transport.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_fragment_is_timeout() {
        let line = ScriptedLine::new(vec![Reply::Frame(vec![0x01, 0x03])]);
        let mut transport = RtuTransport::new(line, AutoDirection, 9600).unwrap();
        transport.send(&[0x01]).await.unwrap();
        let err = transport.receive(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_crc_error() {
        let mut reply = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        reply[3] ^= 0x10;
        let line = ScriptedLine::new(vec![Reply::Frame(reply)]);
        let mut transport = RtuTransport::new(line, AutoDirection, 9600).unwrap();
        transport.send(&[0x01]).await.unwrap();
        let err = transport.receive(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ModbusError::CrcError { .. }));
        assert_eq!(transport.stats().crc_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_write_restores_receive_mode() {
        let mut line = ScriptedLine::new(vec![]);
        line.short_write = true;
        let direction = RecordingDirection::default();
        let mut transport = RtuTransport::new(line, direction.clone(), 9600).unwrap();

        let err = transport.send(&[0x01, 0x03, 0x00, 0x00]).await.unwrap_err();
        assert!(matches!(err, ModbusError::Transport { .. }));
        assert_eq!(direction.events.lock().unwrap().last(), Some(&"rx"));
        assert_eq!(transport.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_gap_between_frames() {
        let line = ScriptedLine::new(vec![Reply::Silence, Reply::Silence]);
        let mut transport = RtuTransport::new(line, AutoDirection, 9600)
            .unwrap()
            .with_frame_gap(Duration::from_millis(50));

        transport.send(&[0x01]).await.unwrap();
        let started = Instant::now();
        transport.send(&[0x01]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_gpio_transceiver_levels() {
        let root = std::env::temp_dir().join(format!("rtu-gpio-{}", std::process::id()));
        for pin in [7, 6] {
            std::fs::create_dir_all(root.join(format!("gpio{}", pin))).unwrap();
        }
        let mut gpio = GpioTransceiver::with_root(&root, 7, 6).unwrap();
        let level =
            |pin: u32| std::fs::read_to_string(root.join(format!("gpio{}/value", pin))).unwrap();

        assert_eq!(level(7), "0");
        gpio.set_transmit().unwrap();
        assert_eq!((level(7).as_str(), level(6).as_str()), ("1", "1"));
        gpio.set_receive().unwrap();
        assert_eq!((level(7).as_str(), level(6).as_str()), ("0", "0"));
        gpio.release().unwrap();

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_gpio_transceiver_rejects_shared_pin() {
        let root = std::env::temp_dir().join(format!("rtu-gpio-shared-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();

        let err = GpioTransceiver::with_root(&root, 5, 5).unwrap_err();
        assert!(matches!(err, ModbusError::InvalidArgument { .. }));
        assert!(!root.join("export").exists());

        std::fs::remove_dir_all(&root).unwrap();
    }
}
