pub mod decoder;
pub mod encoder;
pub mod frame;

use anyhow::Result;

use frame::Frame;

/// Stream properties reported by a frame source when it is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frame count advertised by the container, if any.
    pub frame_count: Option<u64>,
}

/// Sequential producer of decoded frames.
pub trait FrameSource: Send {
    fn info(&self) -> StreamInfo;

    /// Next frame in presentation order, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Consumer that persists frames in the order they are written.
pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and finalize the output. Called once, after the last write.
    fn close(&mut self) -> Result<()>;
}
