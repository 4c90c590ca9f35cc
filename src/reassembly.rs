use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::warn;
use thiserror::Error;

use crate::frame::{encode_frame, FrameError};
use crate::CHUNK_DATA_MAX;

/// Default inactivity window after which a partial session is finalized.
pub const DEFAULT_EXPIRY: Duration = Duration::from_millis(1500);

/// What to do with a session that went quiet before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Discard the partial buffer (default).
    Drop,
    /// Hand the partial buffer to the caller, who knows whether a label
    /// context makes it worth keeping.
    FlushPartial,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Chunked payloads start with `[chunk_index, total_chunks]`.
    #[error("payload of {0} bytes is too short for a chunk header")]
    TruncatedHeader(usize),
    #[error("chunk index {index} out of range for {total} total chunks")]
    IndexOutOfRange { index: u8, total: u8 },
}

/// A partial payload flushed by [`ChunkReassembler::poll_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub cmd: u8,
    /// Received chunk data concatenated in ascending index order; gaps are
    /// simply absent.
    pub partial: Vec<u8>,
    pub received: usize,
    pub total: u8,
}

struct Session {
    total_chunks: u8,
    chunks: HashMap<u8, Vec<u8>>,
    last_update: Instant,
}

impl Session {
    fn concat_ascending(&self) -> Vec<u8> {
        let mut indices: Vec<u8> = self.chunks.keys().copied().collect();
        indices.sort_unstable();
        let mut out = Vec::new();
        for idx in indices {
            out.extend_from_slice(&self.chunks[&idx]);
        }
        out
    }
}

/// Tracks in-flight multi-chunk payloads, one session per command byte.
///
/// Chunks may arrive in any order and may be re-sent; a session completes
/// exactly when `total_chunks` distinct indices have been stored, and the
/// merged payload is concatenated by ascending index, not arrival order.
/// The caller supplies the clock, so expiry is deterministic under test.
pub struct ChunkReassembler {
    sessions: HashMap<u8, Session>,
    expiry: Duration,
    policy: ExpiryPolicy,
}

impl ChunkReassembler {
    pub fn new(policy: ExpiryPolicy) -> Self {
        Self::with_expiry(policy, DEFAULT_EXPIRY)
    }

    pub fn with_expiry(policy: ExpiryPolicy, expiry: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            expiry,
            policy,
        }
    }

    /// Feed one frame payload. Returns the fully reassembled payload when
    /// this chunk completes its session, `None` while chunks are missing.
    pub fn accept(
        &mut self,
        cmd: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        if payload.len() < 2 {
            return Err(ReassemblyError::TruncatedHeader(payload.len()));
        }
        let chunk_index = payload[0];
        let total_chunks = payload[1];
        if chunk_index >= total_chunks {
            return Err(ReassemblyError::IndexOutOfRange {
                index: chunk_index,
                total: total_chunks,
            });
        }
        let chunk_data = &payload[2..];

        let session = self.sessions.entry(cmd).or_insert_with(|| Session {
            total_chunks,
            chunks: HashMap::new(),
            last_update: now,
        });

        // A changed chunk count mid-session is a protocol violation; start
        // over from this chunk rather than merging two transfers.
        if session.total_chunks != total_chunks {
            warn!(
                "cmd {:#04x}: total_chunks changed {} -> {}, resetting session",
                cmd, session.total_chunks, total_chunks
            );
            session.total_chunks = total_chunks;
            session.chunks.clear();
        }

        session.chunks.insert(chunk_index, chunk_data.to_vec());
        session.last_update = now;

        if session.chunks.len() == usize::from(session.total_chunks) {
            let session = self.sessions.remove(&cmd).unwrap();
            return Ok(Some(session.concat_ascending()));
        }
        Ok(None)
    }

    /// Finalize sessions idle for longer than the expiry window. Dropped
    /// partials are logged; flushed partials are returned for the caller
    /// to dispose of.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<Expired> {
        let expiry = self.expiry;
        let stale: Vec<u8> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_update) >= expiry)
            .map(|(&cmd, _)| cmd)
            .collect();

        let mut flushed = Vec::new();
        for cmd in stale {
            let session = self.sessions.remove(&cmd).unwrap();
            let received = session.chunks.len();
            warn!(
                "cmd {:#04x}: reassembly timed out with {}/{} chunks",
                cmd, received, session.total_chunks
            );
            if self.policy == ExpiryPolicy::FlushPartial {
                flushed.push(Expired {
                    cmd,
                    partial: session.concat_ascending(),
                    received,
                    total: session.total_chunks,
                });
            }
        }
        flushed
    }

    /// Abandon all in-flight sessions, e.g. on shutdown.
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.sessions.len()
    }
}

/// Split a payload into chunk-tagged frames the way the device does:
/// `[chunk_index, total_chunks, data..]` per frame, data capped at
/// [`CHUNK_DATA_MAX`] bytes. An empty payload still produces one frame so
/// the receiver sees a complete zero-length transfer.
pub fn split_into_frames(cmd: u8, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    let total_chunks = payload.len().div_ceil(CHUNK_DATA_MAX).max(1);
    if total_chunks > usize::from(u8::MAX) {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    if payload.is_empty() {
        return Ok(vec![encode_frame(cmd, &[0, 1])?]);
    }

    let mut frames = Vec::with_capacity(total_chunks);
    for (index, data) in payload.chunks(CHUNK_DATA_MAX).enumerate() {
        let mut chunk = Vec::with_capacity(2 + data.len());
        chunk.push(index as u8);
        chunk.push(total_chunks as u8);
        chunk.extend_from_slice(data);
        frames.push(encode_frame(cmd, &chunk)?);
    }
    Ok(frames)
}
