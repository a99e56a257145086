//! # kad-events
//!
//! Supporting primitives for the node's single-threaded event loop:
//! periodic/one-shot timers and the ancillary peer-frame parser that is
//! parsed but never acted upon.
//!
//! The loop itself runs on a current-thread Tokio runtime rather than the
//! C reference's hand-rolled `poll()` loop: [`timer::TimerWheel`] replaces
//! the manual soonest-deadline arithmetic, driven by the caller with
//! `tokio::time::sleep_until` directly against `tokio::select!`'s UDP/TCP
//! branches rather than through an intermediate event queue.

pub mod peer_frame;
pub mod timer;

pub use peer_frame::{PeerFrame, PeerFrameError, PeerFrameParser, MAX_FRAME_LEN};
pub use timer::{TimerId, TimerKind, TimerWheel};
