use thiserror::Error;

/// One second of recorded audio, chunked 16-bit LE PCM.
pub const CMD_AUDIO_RECORDING: u8 = 0xA1;
/// End-of-recording marker carrying the total sample count and, on newer
/// firmware, the device's own per-class scores.
pub const CMD_SAMPLE_COUNT: u8 = 0xA2;
/// Same report payload as [`CMD_SAMPLE_COUNT`], emitted per snippet while
/// the device is in continuous streaming mode.
pub const CMD_AUDIO_STREAM: u8 = 0xA3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MessageError {
    #[error("PCM payload of {0} bytes is not a whole number of 16-bit samples")]
    OddPcmLength(usize),
    #[error("sample report of {0} bytes (expected 4, or 8 plus 4 per score)")]
    SampleReportLength(usize),
    #[error("sample report declares {declared} scores but carries {carried}")]
    ScoreCountMismatch { declared: u32, carried: usize },
}

/// Device-side classification report attached to a recording or stream
/// snippet: total samples sent, optionally the on-device per-class scores
/// in label order.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleReport {
    pub total_samples: u32,
    pub scores: Option<Vec<f32>>,
}

/// A fully reassembled payload, interpreted per command byte.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// PCM samples of one recorded snippet.
    AudioRecording { samples: Vec<i16> },
    /// The recording is complete; `report.total_samples` says how many
    /// samples the audio chunks should have added up to.
    RecordingDone { report: SampleReport },
    /// Periodic report while streaming.
    StreamReport { report: SampleReport },
    /// A command this build does not know. Kept so newer firmware doesn't
    /// kill the read loop; the caller decides whether to log it.
    Unknown { cmd: u8, payload: Vec<u8> },
}

/// Interpret a reassembled payload. Chunk headers are already stripped.
pub fn parse_message(cmd: u8, payload: &[u8]) -> Result<DeviceMessage, MessageError> {
    match cmd {
        CMD_AUDIO_RECORDING => Ok(DeviceMessage::AudioRecording {
            samples: pcm_from_le_bytes(payload)?,
        }),
        CMD_SAMPLE_COUNT => Ok(DeviceMessage::RecordingDone {
            report: parse_sample_report(payload)?,
        }),
        CMD_AUDIO_STREAM => Ok(DeviceMessage::StreamReport {
            report: parse_sample_report(payload)?,
        }),
        _ => Ok(DeviceMessage::Unknown {
            cmd,
            payload: payload.to_vec(),
        }),
    }
}

/// 16-bit little-endian PCM, as the device transmits it.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>, MessageError> {
    if bytes.len() % 2 != 0 {
        return Err(MessageError::OddPcmLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Layouts observed on the wire (all little-endian):
/// - 4 bytes: `total_samples: u32` (older firmware)
/// - 8 + 4n bytes: `total_samples: u32`, `class_count: u32`, `n × f32`
fn parse_sample_report(payload: &[u8]) -> Result<SampleReport, MessageError> {
    match payload.len() {
        4 => Ok(SampleReport {
            total_samples: u32::from_le_bytes(payload.try_into().unwrap()),
            scores: None,
        }),
        n if n >= 8 && (n - 8) % 4 == 0 => {
            let total_samples = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            let class_count = u32::from_le_bytes(payload[4..8].try_into().unwrap());
            let carried = (n - 8) / 4;
            if class_count as usize != carried {
                return Err(MessageError::ScoreCountMismatch {
                    declared: class_count,
                    carried,
                });
            }
            let scores = payload[8..]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
                .collect();
            Ok(SampleReport {
                total_samples,
                scores: Some(scores),
            })
        }
        n => Err(MessageError::SampleReportLength(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_recording_decodes_le_samples() {
        let msg = parse_message(CMD_AUDIO_RECORDING, &[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80]);
        assert_eq!(
            msg.unwrap(),
            DeviceMessage::AudioRecording {
                samples: vec![1, -1, i16::MIN]
            }
        );
    }

    #[test]
    fn audio_recording_rejects_odd_byte_count() {
        let err = parse_message(CMD_AUDIO_RECORDING, &[0x01, 0x00, 0xFF]).unwrap_err();
        assert_eq!(err, MessageError::OddPcmLength(3));
    }

    #[test]
    fn basic_sample_count() {
        // 300 samples, the trainer-era 4-byte layout.
        let msg = parse_message(CMD_SAMPLE_COUNT, &[0x2C, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::RecordingDone {
                report: SampleReport {
                    total_samples: 300,
                    scores: None
                }
            }
        );
    }

    #[test]
    fn extended_sample_count_with_scores() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&16000u32.to_le_bytes());
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&0.125f32.to_le_bytes());
        payload.extend_from_slice(&0.875f32.to_le_bytes());

        let msg = parse_message(CMD_AUDIO_STREAM, &payload).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::StreamReport {
                report: SampleReport {
                    total_samples: 16000,
                    scores: Some(vec![0.125, 0.875]),
                }
            }
        );
    }

    #[test]
    fn sample_report_length_checked() {
        assert_eq!(
            parse_message(CMD_SAMPLE_COUNT, &[1, 2, 3]).unwrap_err(),
            MessageError::SampleReportLength(3)
        );
        assert_eq!(
            parse_message(CMD_SAMPLE_COUNT, &[0; 6]).unwrap_err(),
            MessageError::SampleReportLength(6)
        );
    }

    #[test]
    fn score_count_must_match_payload() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_le_bytes());
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(&1.0f32.to_le_bytes()); // only one score
        assert_eq!(
            parse_message(CMD_SAMPLE_COUNT, &payload).unwrap_err(),
            MessageError::ScoreCountMismatch {
                declared: 3,
                carried: 1
            }
        );
    }

    #[test]
    fn unknown_commands_pass_through() {
        let msg = parse_message(0x7F, b"whatever").unwrap();
        assert_eq!(
            msg,
            DeviceMessage::Unknown {
                cmd: 0x7F,
                payload: b"whatever".to_vec()
            }
        );
    }
}
