//! Incremental parser for the ancillary length-prefixed TCP "peer"
//! protocol: 4-byte type tag, 4-byte big-endian payload length, payload.
//!
//! Out of core scope per the spec: frames are parsed and logged only,
//! never acted upon. The loop keeps this parser alive purely because it
//! shares the event loop's socket-polling machinery with the UDP side.

const TAG_LEN: usize = 4;
const LEN_LEN: usize = 4;
const HEADER_LEN: usize = TAG_LEN + LEN_LEN;

/// Frames claiming a payload longer than this are rejected outright
/// rather than buffered, so a peer can't stall the parser into
/// allocating gigabytes off a forged length field.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFrame {
    pub tag: [u8; TAG_LEN],
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerFrameError {
    #[error("peer frame payload length {len} exceeds the {max} byte limit")]
    FrameTooLarge { len: u32, max: u32 },
}

/// Incremental parser: bytes arrive in arbitrary-sized chunks from `recv`,
/// frames may span chunk boundaries.
#[derive(Default)]
pub struct PeerFrameParser {
    buf: Vec<u8>,
}

impl PeerFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly received bytes, returning every frame that became
    /// complete as a result, in arrival order. Errors on an oversized
    /// declared length; the caller should close the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<PeerFrame>, PeerFrameError> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let mut tag = [0u8; TAG_LEN];
            tag.copy_from_slice(&self.buf[..TAG_LEN]);
            let mut len_bytes = [0u8; LEN_LEN];
            len_bytes.copy_from_slice(&self.buf[TAG_LEN..HEADER_LEN]);
            let len = u32::from_be_bytes(len_bytes);
            if len > MAX_FRAME_LEN {
                return Err(PeerFrameError::FrameTooLarge { len, max: MAX_FRAME_LEN });
            }
            let len = len as usize;

            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(..HEADER_LEN + len);
            tracing::debug!(tag = ?tag, len, "peer frame parsed (inert)");
            frames.push(PeerFrame { tag, payload });
        }
        Ok(frames)
    }
}
