//! rollcall-stream: network video acquisition.
//!
//! Wraps an FFmpeg subprocess decoder in a resilient acquisition thread
//! and hands frames to consumers through a small bounded buffer.

pub mod buffer;
pub mod frame;
pub mod source;

pub use buffer::FrameBuffer;
pub use frame::Frame;
pub use source::{FfmpegDecoder, FrameDecoder, StreamConfig, StreamError, StreamSource, StreamState};
