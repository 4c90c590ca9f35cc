use log::warn;
use thiserror::Error;

use crate::{MAX_PAYLOAD, PACKET_MAGIC};

/// Cumulative XOR fold over cmd, length (high byte first) and payload.
///
/// This is the checksum the device firmware computes; it is not a
/// polynomial CRC, so the fold order only matters for matching the wire
/// contract byte for byte.
pub fn crc8(cmd: u8, length: u16, payload: &[u8]) -> u8 {
    let mut crc = cmd ^ (length >> 8) as u8 ^ (length & 0xFF) as u8;
    for &b in payload {
        crc ^= b;
    }
    crc
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The payload cannot be represented in the 16-bit length field.
    #[error("payload of {0} bytes overflows the 16-bit length field")]
    PayloadTooLarge(usize),
    /// The declared length exceeds the configured payload bound. Guards
    /// against a corrupted length field blocking on a payload read.
    #[error("declared payload length {0} exceeds the {MAX_PAYLOAD}-byte bound")]
    LengthOutOfBounds(usize),
    /// Transmitted and computed CRC disagree; the frame is lost.
    #[error("crc mismatch for cmd {cmd:#04x}: got {got:#04x}, computed {computed:#04x}")]
    CrcMismatch { cmd: u8, got: u8, computed: u8 },
}

/// One complete magic-delimited, CRC-checked unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// Encode a frame: `[0xAB, 0xCD, cmd, len_hi, len_lo, payload.., crc]`.
pub fn encode_frame(cmd: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let length = payload.len() as u16;
    let mut out = Vec::with_capacity(6 + payload.len());
    out.extend_from_slice(&PACKET_MAGIC);
    out.push(cmd);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
    out.push(crc8(cmd, length, payload));
    Ok(out)
}

enum State {
    /// Scanning for the first magic byte. Steady-state noise, never logged.
    Sync,
    /// First magic byte seen, waiting for the second.
    Magic,
    Cmd,
    LenHi,
    LenLo,
    Payload,
    Crc,
}

/// Incremental frame decoder. Feed bytes with [`FrameDecoder::push`]; a
/// complete, CRC-valid frame is returned from the byte that finishes it.
///
/// CRC and length errors are recoverable: the decoder resets itself and
/// resumes scanning for the next magic sequence, so the caller can log the
/// error and keep pushing. Note the wire format has no payload escaping; a
/// magic sequence inside a corrupted stream can start a false frame, and
/// the CRC check is what catches it.
pub struct FrameDecoder {
    state: State,
    cmd: u8,
    length: usize,
    len_hi: u8,
    payload: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Sync,
            cmd: 0,
            length: 0,
            len_hi: 0,
            payload: Vec::new(),
        }
    }

    /// Discard any partially decoded frame and restart the magic search.
    pub fn reset(&mut self) {
        self.state = State::Sync;
        self.payload = Vec::new();
    }

    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>, FrameError> {
        match self.state {
            State::Sync => {
                if byte == PACKET_MAGIC[0] {
                    self.state = State::Magic;
                }
                Ok(None)
            }
            State::Magic => {
                if byte == PACKET_MAGIC[1] {
                    self.state = State::Cmd;
                } else if byte != PACKET_MAGIC[0] {
                    self.state = State::Sync;
                }
                // A repeated first magic byte stays here: it may still
                // start a frame.
                Ok(None)
            }
            State::Cmd => {
                self.cmd = byte;
                self.state = State::LenHi;
                Ok(None)
            }
            State::LenHi => {
                self.len_hi = byte;
                self.state = State::LenLo;
                Ok(None)
            }
            State::LenLo => {
                self.length = u16::from_be_bytes([self.len_hi, byte]) as usize;
                if self.length > MAX_PAYLOAD {
                    let err = FrameError::LengthOutOfBounds(self.length);
                    self.reset();
                    return Err(err);
                }
                self.payload = Vec::with_capacity(self.length);
                self.state = if self.length == 0 {
                    State::Crc
                } else {
                    State::Payload
                };
                Ok(None)
            }
            State::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.length {
                    self.state = State::Crc;
                }
                Ok(None)
            }
            State::Crc => {
                let computed = crc8(self.cmd, self.length as u16, &self.payload);
                let cmd = self.cmd;
                let payload = std::mem::take(&mut self.payload);
                self.state = State::Sync;
                if byte != computed {
                    warn!(
                        "dropping frame cmd={:#04x} len={}: crc {:#04x} != {:#04x}",
                        cmd,
                        payload.len(),
                        byte,
                        computed
                    );
                    return Err(FrameError::CrcMismatch {
                        cmd,
                        got: byte,
                        computed,
                    });
                }
                Ok(Some(Frame { cmd, payload }))
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> (Vec<Frame>, Vec<FrameError>) {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        for &b in bytes {
            match decoder.push(b) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        (frames, errors)
    }

    #[test]
    fn roundtrip() {
        let payload = b"\x01\x02\x03hello";
        let bytes = encode_frame(0xA1, payload).unwrap();
        let (frames, errors) = decode_all(&bytes);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd, 0xA1);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let bytes = encode_frame(0x42, &[]).unwrap();
        let (frames, errors) = decode_all(&bytes);
        assert!(errors.is_empty());
        assert_eq!(frames, vec![Frame { cmd: 0x42, payload: vec![] }]);
    }

    #[test]
    fn sample_count_frame_layout() {
        // 6-byte sample-count payload as the device emits it.
        let payload = b"\x00\x01\x2c\x01\x00\x00";
        let bytes = encode_frame(0xA2, payload).unwrap();
        assert_eq!(&bytes[..5], &[0xAB, 0xCD, 0xA2, 0x00, 0x06]);
        assert_eq!(&bytes[5..11], payload);
        assert_eq!(bytes[11], crc8(0xA2, 6, payload));

        let (frames, errors) = decode_all(&bytes);
        assert!(errors.is_empty());
        assert_eq!(frames[0].cmd, 0xA2);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn crc_sensitive_to_any_single_bit_flip() {
        let payload = b"\x10\x20\x30\x40";
        let bytes = encode_frame(0x07, payload).unwrap();
        // Flip every bit of every byte except the magic (which desyncs
        // instead) and the CRC byte itself.
        for idx in 2..bytes.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[idx] ^= 1 << bit;
                let (frames, errors) = decode_all(&corrupted);
                assert!(
                    frames.is_empty(),
                    "flip at byte {idx} bit {bit} still decoded"
                );
                // A length-field flip may fail as out-of-bounds or leave
                // the decoder waiting for more payload; everything else
                // must surface a CRC error.
                if idx != 3 && idx != 4 {
                    assert_eq!(errors.len(), 1, "flip at byte {idx} bit {bit}");
                    assert!(matches!(errors[0], FrameError::CrcMismatch { .. }));
                }
            }
        }
    }

    #[test]
    fn resynchronizes_after_leading_garbage() {
        let mut stream = vec![0x00, 0x11, 0xCD, 0xAB, 0x99, 0xFE];
        stream.extend(encode_frame(0xA1, b"data").unwrap());
        let (frames, errors) = decode_all(&stream);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"data");
    }

    #[test]
    fn resynchronizes_on_repeated_magic_high_byte() {
        // 0xAB 0xAB 0xCD: the second 0xAB restarts the magic match.
        let mut stream = vec![0xAB];
        stream.extend(encode_frame(0x01, b"x").unwrap());
        let (frames, errors) = decode_all(&stream);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd, 0x01);
    }

    #[test]
    fn recovers_after_crc_error() {
        let mut good = encode_frame(0xA1, b"first").unwrap();
        let last = good.len() - 1;
        good[last] ^= 0xFF; // corrupt the CRC
        let mut stream = good;
        stream.extend(encode_frame(0xA1, b"second").unwrap());

        let (frames, errors) = decode_all(&stream);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], FrameError::CrcMismatch { .. }));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"second");
    }

    #[test]
    fn rejects_out_of_bounds_length_before_payload() {
        let mut stream = vec![0xAB, 0xCD, 0xA1, 0xFF, 0xFF];
        // The bogus length must be rejected immediately, and the stream
        // rescanned so a following frame still decodes.
        stream.extend(encode_frame(0xA1, b"ok").unwrap());
        let (frames, errors) = decode_all(&stream);
        assert_eq!(errors, vec![FrameError::LengthOutOfBounds(0xFFFF)]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"ok");
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        let err = encode_frame(0x01, &payload).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge(_)));
    }

    #[test]
    fn partial_frame_yields_nothing() {
        let bytes = encode_frame(0xA1, b"incomplete").unwrap();
        let (frames, errors) = decode_all(&bytes[..bytes.len() - 3]);
        assert!(frames.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn reset_discards_partial_frame() {
        let bytes = encode_frame(0xA1, b"abandoned").unwrap();
        let mut decoder = FrameDecoder::new();
        for &b in &bytes[..7] {
            decoder.push(b).unwrap();
        }
        decoder.reset();
        // The tail of the abandoned frame is noise to a fresh scan.
        for &b in &bytes[7..] {
            assert_eq!(decoder.push(b).unwrap(), None);
        }
        let bytes = encode_frame(0xA3, b"fresh").unwrap();
        let mut got = None;
        for &b in &bytes {
            if let Some(frame) = decoder.push(b).unwrap() {
                got = Some(frame);
            }
        }
        assert_eq!(got.unwrap().payload, b"fresh");
    }

    #[test]
    fn crc_matches_firmware_fold() {
        // crc = cmd ^ len_hi ^ len_lo ^ payload bytes
        assert_eq!(crc8(0xA2, 0x0006, &[0x00, 0x01, 0x2C, 0x01, 0x00, 0x00]),
                   0xA2 ^ 0x00 ^ 0x06 ^ 0x01 ^ 0x2C ^ 0x01);
        assert_eq!(crc8(0x00, 0x0000, &[]), 0x00);
        assert_eq!(crc8(0xFF, 0x0102, &[0xFF]), 0xFF ^ 0x01 ^ 0x02 ^ 0xFF);
    }
}
