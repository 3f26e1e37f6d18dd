//! Wire-level definitions shared by the agent and the broker
//!
//! This crate holds the constants of the broker connect handshake and the
//! frame codec used to multiplex logical streams over one WebSocket
//! connection.
//!
//! # Frame format
//!
//! Each WebSocket binary message carries exactly one frame:
//!
//! ```text
//! +----------------+---------+------------------+
//! | stream id (4)  | type(1) | payload (0..n)   |
//! +----------------+---------+------------------+
//! ```
//!
//! - `DATA` carries stream bytes; the first `DATA` for an unknown id opens the stream
//! - `FIN` half-closes the sender's side
//! - `RST` aborts the stream in both directions
//! - `WINDOW_UPDATE` returns receive credit (`u32` big-endian increment)

pub mod frame;

pub use frame::{Frame, FrameType, ProtoError, FRAME_HEADER_LEN};

/// Path appended to the broker URL for the agent connect request
pub const CONNECT_PATH: &str = "/agent/connect";

/// Header carrying the agent's base64-encoded public key
///
/// Sent as `X-BoreD-PublicKey`; kept lowercase so it can be used as a
/// static HTTP header name.
pub const PUBLIC_KEY_HEADER: &str = "x-bored-publickey";

/// Largest payload placed in a single `DATA` frame
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Initial per-stream receive window, in bytes
pub const INITIAL_WINDOW: u32 = 256 * 1024;
