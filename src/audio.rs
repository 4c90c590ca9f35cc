use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::mpsc;

use crate::{SAMPLE_RATE, STEP_SAMPLES};

/// Blocks buffered between the audio callback and the consumer loop.
const BLOCK_QUEUE_DEPTH: usize = 32;

/// Microphone capture delivering step-sized mono i16 blocks.
///
/// Prefers a native i16 input stream and falls back to f32 with sample
/// conversion, since many devices only expose one of the two. The cpal
/// callback accumulates samples and hands out exactly
/// [`STEP_SAMPLES`]-sized blocks over a bounded channel; if the consumer
/// stalls, whole blocks are dropped rather than blocking the callback.
pub struct AudioCapture {
    _stream: Stream,
    receiver: Receiver<Vec<i16>>,
}

impl AudioCapture {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("no input device available")?;

        let native_i16 = device
            .supported_input_configs()
            .context("failed to query supported input configs")?
            .any(|c| {
                c.channels() == 1
                    && c.sample_format() == SampleFormat::I16
                    && c.min_sample_rate().0 <= SAMPLE_RATE
                    && c.max_sample_rate().0 >= SAMPLE_RATE
            });

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let (sender, receiver) = mpsc::sync_channel(BLOCK_QUEUE_DEPTH);
        let err_fn = |err| log::warn!("audio stream error: {err}");

        let stream = if native_i16 {
            let mut chopper = BlockChopper::new(sender);
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| chopper.feed(data),
                err_fn,
                None,
            )?
        } else {
            let mut chopper = BlockChopper::new(sender);
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                        .collect();
                    chopper.feed(&samples);
                },
                err_fn,
                None,
            )?
        };

        stream.play().context("failed to start audio stream")?;

        Ok(Self {
            _stream: stream,
            receiver,
        })
    }

    /// Try to read one block (non-blocking).
    pub fn try_read(&self) -> Option<Vec<i16>> {
        self.receiver.try_recv().ok()
    }

    /// Read one block (blocking).
    pub fn read(&self) -> Result<Vec<i16>> {
        self.receiver.recv().context("audio channel closed")
    }
}

/// Accumulates callback data and emits exact step-sized blocks.
struct BlockChopper {
    buffer: Vec<i16>,
    sender: SyncSender<Vec<i16>>,
}

impl BlockChopper {
    fn new(sender: SyncSender<Vec<i16>>) -> Self {
        Self {
            buffer: Vec::with_capacity(STEP_SAMPLES * 2),
            sender,
        }
    }

    fn feed(&mut self, data: &[i16]) {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= STEP_SAMPLES {
            let block: Vec<i16> = self.buffer.drain(..STEP_SAMPLES).collect();
            match self.sender.try_send(block) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("audio consumer lagging, dropping a {STEP_SAMPLES}-sample block");
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chopper_emits_exact_blocks() {
        let (sender, receiver) = mpsc::sync_channel(8);
        let mut chopper = BlockChopper::new(sender);

        chopper.feed(&vec![1i16; STEP_SAMPLES / 2]);
        assert!(receiver.try_recv().is_err());

        chopper.feed(&vec![2i16; STEP_SAMPLES]);
        let block = receiver.try_recv().unwrap();
        assert_eq!(block.len(), STEP_SAMPLES);
        assert_eq!(block[0], 1);
        assert_eq!(block[STEP_SAMPLES - 1], 2);
        // The remainder stays buffered for the next callback.
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn chopper_drops_blocks_when_queue_is_full() {
        let (sender, receiver) = mpsc::sync_channel(1);
        let mut chopper = BlockChopper::new(sender);
        chopper.feed(&vec![1i16; STEP_SAMPLES]);
        chopper.feed(&vec![2i16; STEP_SAMPLES]); // dropped, queue full
        assert_eq!(receiver.try_recv().unwrap()[0], 1);
        assert!(receiver.try_recv().is_err());
    }
}
