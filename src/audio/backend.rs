use crate::error::Result;

use super::capture::CaptureSource;
use super::playback::PlaybackSink;

/// Hands out fresh device handles for each live session.
///
/// Every successful `open_*` call is an acquisition the session must balance
/// with `CaptureSource::stop` / `PlaybackSink::close`.
pub trait AudioBackend: Send + Sync {
    /// Acquire a microphone producing `frame_size` mono frames at `sample_rate`
    fn open_capture(&self, sample_rate: u32, frame_size: usize) -> Result<Box<dyn CaptureSource>>;

    /// Acquire a speaker
    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>>;
}

#[cfg(feature = "device")]
pub use self::device::CpalBackend;

#[cfg(feature = "device")]
mod device {
    use super::AudioBackend;
    use crate::audio::capture::{CaptureSource, DeviceCapture};
    use crate::audio::playback::{DevicePlayback, PlaybackSink};
    use crate::error::Result;

    /// Default host devices, optionally pinned by name
    #[derive(Debug, Clone, Default)]
    pub struct CpalBackend {
        input_device: Option<String>,
        output_device: Option<String>,
    }

    impl CpalBackend {
        pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
            Self {
                input_device,
                output_device,
            }
        }
    }

    impl AudioBackend for CpalBackend {
        fn open_capture(&self, sample_rate: u32, frame_size: usize) -> Result<Box<dyn CaptureSource>> {
            let capture = DeviceCapture::open(self.input_device.as_deref(), sample_rate, frame_size)?;
            Ok(Box::new(capture))
        }

        fn open_playback(&self) -> Result<Box<dyn PlaybackSink>> {
            let playback = DevicePlayback::open(self.output_device.as_deref())?;
            Ok(Box::new(playback))
        }
    }
}
