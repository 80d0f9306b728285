use image::RgbImage;

/// A single decoded video frame with metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame's image data.
    pub image: RgbImage,
    /// Absolute frame number from the start of the source (0-based).
    pub frame_number: u64,
    /// Elapsed seconds from the start of the source.
    pub timestamp_seconds: f64,
}

impl Frame {
    pub fn new(image: RgbImage, frame_number: u64, timestamp_seconds: f64) -> Self {
        Self {
            image,
            frame_number,
            timestamp_seconds,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// An item tagged with the sequence number it was ingested under.
///
/// Sequence numbers start at 0 and are gap-free for a run; they are the only
/// identity used to restore order after concurrent processing.
#[derive(Debug)]
pub struct Sequenced<T> {
    pub seq: u64,
    pub item: T,
}

pub type SequencedFrame = Sequenced<Frame>;
