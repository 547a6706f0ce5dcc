use crate::error::Result;

use super::dsp::downmix;

/// Receives each complete mono frame from the capture thread
pub type FrameCallback = Box<dyn FnMut(Vec<f32>) + Send + 'static>;

/// A microphone that pushes fixed-size frames once started.
///
/// A source is single-use: after `stop()` it cannot be started again, the
/// owner acquires a fresh one instead.
pub trait CaptureSource: Send {
    /// Start delivering frames to `on_frame`
    fn start(&mut self, on_frame: FrameCallback) -> Result<()>;

    /// Release the device. Calling it twice is a no-op.
    fn stop(&mut self);
}

/// Cuts device callbacks into mono frames at the target rate.
///
/// Resampling runs across callback boundaries: the fractional read position and
/// the last sample of the previous callback carry over, so callback sizes never
/// shift the output timing.
pub struct FrameAssembler {
    channels: usize,
    /// Input samples advanced per output sample
    step: f64,
    frame_size: usize,
    pending: Vec<f32>,
    /// Next read position, relative to the start of the upcoming callback.
    /// Negative positions fall between `last` and the first new sample.
    position: f64,
    last: Option<f32>,
}

impl FrameAssembler {
    pub fn new(device_rate: u32, channels: u16, target_rate: u32, frame_size: usize) -> Self {
        Self {
            channels: channels.max(1) as usize,
            step: device_rate.max(1) as f64 / target_rate.max(1) as f64,
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size * 2),
            position: 0.0,
            last: None,
        }
    }

    /// Feed interleaved device samples, emitting every completed frame
    pub fn push<F>(&mut self, data: &[f32], mut emit: F)
    where
        F: FnMut(Vec<f32>),
    {
        let mono = downmix(data, self.channels);
        if (self.step - 1.0).abs() < f64::EPSILON {
            self.pending.extend_from_slice(&mono);
        } else {
            self.resample_into_pending(&mono);
        }

        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            emit(frame);
        }
    }

    fn resample_into_pending(&mut self, mono: &[f32]) {
        let Some(&newest) = mono.last() else {
            return;
        };
        let end = (mono.len() - 1) as f64;
        let last = self.last;
        let sample_at = |index: isize| -> f32 {
            if index < 0 {
                last.unwrap_or(mono[0])
            } else {
                mono[index as usize]
            }
        };

        let mut position = self.position;
        while position <= end {
            let floor = position.floor();
            let frac = (position - floor) as f32;
            let index = floor as isize;
            let s1 = sample_at(index);
            let s2 = if frac > 0.0 { sample_at(index + 1) } else { s1 };
            self.pending.push(s1 + (s2 - s1) * frac);
            position += self.step;
        }

        self.position = position - mono.len() as f64;
        self.last = Some(newest);
    }

    /// Samples waiting for the next frame boundary
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(feature = "device")]
pub use self::device::{list_input_devices, DeviceCapture};

#[cfg(feature = "device")]
mod device {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, Stream, StreamConfig};

    use super::{CaptureSource, FrameAssembler, FrameCallback};
    use crate::error::{LiveError, Result};

    /// List available input devices
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to enumerate input devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Microphone capture using cpal
    pub struct DeviceCapture {
        device: Device,
        stream: Option<Stream>,
        target_rate: u32,
        frame_size: usize,
        stopped: bool,
    }

    // Safety: the stream is only touched from the owning session under its lock
    unsafe impl Send for DeviceCapture {}

    impl DeviceCapture {
        /// Acquire an input device by name, or the default one
        pub fn open(device_name: Option<&str>, target_rate: u32, frame_size: usize) -> Result<Self> {
            let host = cpal::default_host();
            let device = match device_name {
                Some(name) => host
                    .input_devices()
                    .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to enumerate devices: {}", e)))?
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| LiveError::DeviceUnavailable(format!("Device '{}' not found", name)))?,
                None => host
                    .default_input_device()
                    .ok_or_else(|| LiveError::DeviceUnavailable("No default input device".to_string()))?,
            };

            tracing::info!("Acquired input device: {}", device.name().unwrap_or_default());

            Ok(Self {
                device,
                stream: None,
                target_rate,
                frame_size,
                stopped: false,
            })
        }

        fn build<T, C>(
            &self,
            config: &StreamConfig,
            mut assembler: FrameAssembler,
            mut on_frame: FrameCallback,
            convert: C,
        ) -> Result<Stream>
        where
            T: cpal::SizedSample,
            C: Fn(T) -> f32 + Send + 'static,
        {
            self.device
                .build_input_stream(
                    config,
                    move |data: &[T], _: &cpal::InputCallbackInfo| {
                        let samples: Vec<f32> = data.iter().map(|&s| convert(s)).collect();
                        assembler.push(&samples, |frame| on_frame(frame));
                    },
                    |err| {
                        tracing::error!("Audio capture error: {}", err);
                    },
                    None,
                )
                .map_err(map_build_error)
        }
    }

    impl CaptureSource for DeviceCapture {
        fn start(&mut self, on_frame: FrameCallback) -> Result<()> {
            if self.stopped {
                return Err(LiveError::DeviceUnavailable("capture source already stopped".to_string()));
            }
            if self.stream.is_some() {
                return Ok(());
            }

            let supported_config = self.device.default_input_config().map_err(|e| match e {
                cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                    LiveError::DeviceUnavailable("input device disconnected".to_string())
                }
                other => LiveError::DeviceUnavailable(other.to_string()),
            })?;

            tracing::info!(
                "Using capture config: {} Hz, {} channels, {:?}",
                supported_config.sample_rate().0,
                supported_config.channels(),
                supported_config.sample_format()
            );

            let config = supported_config.config();
            let assembler = FrameAssembler::new(
                config.sample_rate.0,
                config.channels,
                self.target_rate,
                self.frame_size,
            );

            let stream = match supported_config.sample_format() {
                SampleFormat::F32 => self.build::<f32, _>(&config, assembler, on_frame, |s| s),
                SampleFormat::I16 => {
                    self.build::<i16, _>(&config, assembler, on_frame, |s| s as f32 / 32768.0)
                }
                SampleFormat::U16 => self.build::<u16, _>(&config, assembler, on_frame, |s| {
                    (s as f32 / u16::MAX as f32) * 2.0 - 1.0
                }),
                format => {
                    return Err(LiveError::DeviceUnavailable(format!(
                        "Unsupported sample format: {:?}",
                        format
                    )));
                }
            }?;

            stream
                .play()
                .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to start capture: {}", e)))?;

            self.stream = Some(stream);
            tracing::info!("Audio capture started");
            Ok(())
        }

        fn stop(&mut self) {
            if self.stopped {
                return;
            }
            self.stopped = true;
            // Dropping the stream ends the device callbacks
            self.stream = None;
            tracing::info!("Audio capture stopped");
        }
    }

    impl Drop for DeviceCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn looks_like_permission(description: &str) -> bool {
        let lower = description.to_lowercase();
        lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    }

    fn map_build_error(err: cpal::BuildStreamError) -> LiveError {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                LiveError::DeviceUnavailable("input device disconnected".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } if looks_like_permission(&err.description) => {
                LiveError::PermissionDenied
            }
            other => LiveError::DeviceUnavailable(format!("Failed to build input stream: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_exact_size() {
        let mut assembler = FrameAssembler::new(16000, 1, 16000, 4096);
        let mut frames = Vec::new();

        // device callbacks rarely line up with frame boundaries
        for _ in 0..5 {
            assembler.push(&vec![0.1f32; 1000], |f| frames.push(f));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 4096);
        assert_eq!(assembler.pending_len(), 5000 - 4096);

        assembler.push(&vec![0.1f32; 4000], |f| frames.push(f));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_stereo_48k_to_mono_16k() {
        let mut assembler = FrameAssembler::new(48000, 2, 16000, 160);
        let mut frames = Vec::new();

        // 10ms of stereo at 48kHz: 480 frames, 960 interleaved samples
        let data: Vec<f32> = (0..960).map(|i| if i % 2 == 0 { 0.5 } else { 0.0 }).collect();
        assembler.push(&data, |f| frames.push(f));

        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|s| (s - 0.25).abs() < 1e-6));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_small_callbacks_do_not_drift() {
        let mut assembler = FrameAssembler::new(44100, 1, 16000, 1);
        let mut produced = 0usize;

        // one second of 512-sample callbacks
        let callbacks = 44100 / 512;
        for _ in 0..callbacks {
            assembler.push(&[0.0f32; 512], |_| produced += 1);
        }

        let expected = (callbacks * 512) as f64 * 16000.0 / 44100.0;
        assert!((produced as f64 - expected).abs() <= 1.0, "{} vs {}", produced, expected);
    }

    #[test]
    fn test_resampling_is_continuous_across_callbacks() {
        let mut assembler = FrameAssembler::new(44100, 1, 16000, 1);
        let mut output = Vec::new();

        // a ramp stays a ramp however the input is split
        let ramp: Vec<f32> = (0..4410).map(|i| i as f32 * 0.0001).collect();
        for chunk in ramp.chunks(97) {
            assembler.push(chunk, |f| output.extend(f));
        }

        let step = 44100.0 / 16000.0;
        assert!(output.len() > 1500);
        for (k, sample) in output.iter().enumerate() {
            let expected = (k as f64 * step * 0.0001) as f32;
            assert!((sample - expected).abs() < 1e-4, "sample {}: {} vs {}", k, sample, expected);
        }
    }
}
