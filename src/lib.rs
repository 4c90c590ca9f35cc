pub mod audio;
pub mod detector;
pub mod frame;
pub mod message;
pub mod model;
pub mod reassembly;
pub mod transport;

// Critical constants - must match the device firmware exactly
pub const SAMPLE_RATE: u32 = 16000;
pub const WINDOW_SAMPLES: usize = 16000; // 1s inference window at 16kHz
pub const STEP_SAMPLES: usize = 800; // 50ms between inference ticks
pub const BYTES_PER_SAMPLE: usize = 2; // 16-bit PCM

// Wire protocol
pub const PACKET_MAGIC: [u8; 2] = [0xAB, 0xCD];
pub const MAX_PAYLOAD: usize = 1024; // reject corrupted length fields above this
pub const CHUNK_DATA_MAX: usize = 512; // device splits payloads at this size

// Debounce
pub const DEBOUNCE_TICKS: u32 = 4;
pub const IGNORE_LABELS: &[&str] = &["silence", "background", "unknown"];

pub use detector::CommandDetector;
