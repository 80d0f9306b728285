use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::frame::Frame;
use super::FrameSink;

/// Encoder options passed through to ffmpeg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// ffmpeg video codec name.
    pub codec: String,
    /// Constant rate factor; lower is higher quality.
    pub crf: u8,
    /// Output pixel format.
    pub pix_fmt: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            crf: 18,
            pix_fmt: "yuv420p".to_string(),
        }
    }
}

/// Encodes frames by piping raw RGB24 data into the ffmpeg CLI.
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl VideoEncoder {
    /// Spawn an ffmpeg process writing `path` at `fps` with the given frame size.
    pub fn open(
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
        settings: &EncoderSettings,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("invalid output dimensions: {width}x{height}");
        }
        if !(fps > 0.0) {
            bail!("invalid output frame rate: {fps}");
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        info!(?path, width, height, fps, codec = %settings.codec, "spawning ffmpeg encoder process");

        let size = format!("{width}x{height}");
        let rate = format!("{fps}");
        let crf = settings.crf.to_string();

        let mut child = Command::new("ffmpeg")
            .args(["-y", "-v", "error"])
            .args([
                "-f", "rawvideo",
                "-pix_fmt", "rgb24",
                "-s", &size,
                "-r", &rate,
                "-i", "pipe:0",
            ])
            .args([
                "-c:v", &settings.codec,
                "-crf", &crf,
                "-pix_fmt", &settings.pix_fmt,
            ])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to spawn ffmpeg — is ffmpeg installed?")?;

        let stdin = child.stdin.take().context("ffmpeg stdin not available")?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            width,
            height,
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameSink for VideoEncoder {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height {
            bail!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }

        let stdin = self.stdin.as_mut().context("encoder already closed")?;
        stdin
            .write_all(frame.image.as_raw())
            .context("failed to write frame to ffmpeg pipe")?;

        self.frames_written += 1;
        debug!(frames_written = self.frames_written, "encoded frame");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping stdin signals EOF to ffmpeg.
        let Some(stdin) = self.stdin.take() else {
            return Ok(());
        };
        drop(stdin);

        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            error!(%status, "ffmpeg encoder exited with failure");
            bail!("ffmpeg encoder exited with {status}");
        }

        info!(frames_written = self.frames_written, "video encoder closed");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            // Never closed: the output is incomplete, do not leave ffmpeg running.
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
