use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serialport::SerialPortType;

use crate::frame::{Frame, FrameDecoder};

/// Serial read timeout. On expiry the current read attempt yields no
/// frame and the caller simply retries.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Frames queued between the reader thread and the consumer loop.
const FRAME_QUEUE_DEPTH: usize = 64;

/// Pulls frames out of a timeout-bounded byte stream.
///
/// A read timeout abandons the in-progress attempt without keeping
/// partial frame state: the next call restarts from the magic-byte
/// search, exactly like the serial readers on the device side. CRC and
/// length errors are logged by the decoder and scanning continues, so
/// the only errors that escape are real I/O failures.
pub struct FrameReader<R: Read> {
    source: R,
    decoder: FrameDecoder,
    pending: VecDeque<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    /// Read until one valid frame is complete, the stream times out
    /// (`Ok(None)`), or the stream fails.
    pub fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut buf = [0u8; 256];
        loop {
            while let Some(byte) = self.pending.pop_front() {
                match self.decoder.push(byte) {
                    Ok(Some(frame)) => return Ok(Some(frame)),
                    Ok(None) => {}
                    // Recoverable: already logged, keep scanning.
                    Err(_) => {}
                }
            }

            match self.source.read(&mut buf) {
                Ok(0) => {
                    self.decoder.reset();
                    return Ok(None);
                }
                Ok(n) => self.pending.extend(&buf[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    self.decoder.reset();
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Background reader over a serial port.
///
/// The port lives on its own thread so a blocking read can never stall
/// the consumer loop; decoded frames arrive through a bounded channel,
/// mirroring how microphone capture is delivered.
pub struct SerialLink {
    receiver: Receiver<Frame>,
    stop: Arc<AtomicBool>,
}

impl SerialLink {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("failed to open serial port {port_name}"))?;
        info!("listening on {port_name} at {baud_rate} baud");

        let (sender, receiver) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || reader_loop(FrameReader::new(port), sender, stop_flag))
            .context("failed to spawn the serial reader thread")?;

        Ok(Self { receiver, stop })
    }

    /// Next decoded frame, if one is waiting (non-blocking).
    pub fn try_read(&self) -> Option<Frame> {
        match self.receiver.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking read; fails once the reader thread has shut down.
    pub fn read(&self) -> Result<Frame> {
        self.receiver.recv().context("serial link closed")
    }

    /// True while the reader thread is alive and producing.
    pub fn is_open(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        // The thread notices within one read timeout and exits.
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn reader_loop<R: Read>(mut reader: FrameReader<R>, sender: SyncSender<Frame>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match reader.read_frame() {
            Ok(Some(frame)) => {
                debug!("frame cmd={:#04x} len={}", frame.cmd, frame.payload.len());
                if sender.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {} // timeout, retry
            Err(e) => {
                warn!("serial read failed: {e}");
                break;
            }
        }
    }
    stop.store(true, Ordering::Relaxed);
}

/// Find the device's serial port by USB product description.
///
/// Succeeds only when exactly one port matches; anything else lists the
/// candidates so the caller can pass an explicit port instead.
pub fn find_device_port(description: &str) -> Result<String> {
    let ports = serialport::available_ports().context("failed to enumerate serial ports")?;
    let matches: Vec<_> = ports
        .iter()
        .filter(|p| match &p.port_type {
            SerialPortType::UsbPort(usb) => usb
                .product
                .as_deref()
                .is_some_and(|product| product.contains(description)),
            _ => false,
        })
        .collect();

    match matches.as_slice() {
        [port] => Ok(port.port_name.clone()),
        [] => {
            let known: Vec<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();
            bail!(
                "no serial port matching \"{description}\" (available: {})",
                if known.is_empty() { "none".into() } else { known.join(", ") }
            )
        }
        many => bail!(
            "{} ports match \"{description}\": {}",
            many.len(),
            many.iter().map(|p| p.port_name.as_str()).collect::<Vec<_>>().join(", ")
        ),
    }
}
