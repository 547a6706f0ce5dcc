use std::collections::VecDeque;

/// Decoded remote audio waiting to be played
#[derive(Clone, Debug, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Output device boundary: a clock plus "play this buffer at that time".
pub trait PlaybackSink: Send {
    /// Seconds elapsed on the device clock
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `start_at` on the device clock
    fn schedule(&mut self, start_at: f64, buffer: PcmBuffer);

    /// Release the device; anything not yet played is discarded
    fn close(&mut self);
}

/// Gapless scheduler for incoming audio.
///
/// Each buffer starts at `max(next_start_time, now)` and pushes
/// `next_start_time` forward by its duration, so buffers that arrive ahead of
/// playback line up back to back and a late buffer starts immediately.
pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    next_start_time: f64,
    released: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        let next_start_time = sink.current_time().max(0.0);
        Self {
            sink,
            next_start_time,
            released: false,
        }
    }

    /// Schedule a buffer, returning its start time
    pub fn enqueue(&mut self, buffer: PcmBuffer) -> f64 {
        if self.released {
            tracing::debug!("Dropping audio buffer enqueued after release");
            return self.next_start_time;
        }

        let start = self.next_start_time.max(self.sink.current_time());
        let duration = buffer.duration();
        self.sink.schedule(start, buffer);
        self.next_start_time = start + duration;
        start
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Close the sink. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.sink.close();
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.release();
    }
}

struct ScheduledBuffer {
    start: u64,
    samples: Vec<f32>,
}

/// Frame-indexed queue rendered by the output callback.
///
/// The cursor counts frames handed to the device and doubles as the playback
/// clock.
pub struct Timeline {
    rate: u32,
    cursor: u64,
    tail: u64,
    queue: VecDeque<ScheduledBuffer>,
}

impl Timeline {
    pub fn new(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            cursor: 0,
            tail: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn current_time(&self) -> f64 {
        self.cursor as f64 / self.rate as f64
    }

    /// Queue mono samples (already at the timeline rate) at `start_at` seconds
    pub fn schedule(&mut self, start_at: f64, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }

        let requested = (start_at.max(0.0) * self.rate as f64).round() as u64;
        // Absorb one frame of rounding so back-to-back buffers stay contiguous
        let start = if requested <= self.tail + 1 {
            self.tail.max(self.cursor)
        } else {
            requested.max(self.cursor)
        };

        self.tail = start + samples.len() as u64;
        self.queue.push_back(ScheduledBuffer { start, samples });
    }

    /// Fill an interleaved output buffer, fanning mono out to every channel
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            let value = self.next_sample();
            frame.fill(value);
        }
    }

    fn next_sample(&mut self) -> f32 {
        let pos = self.cursor;
        self.cursor += 1;

        while let Some(front) = self.queue.front() {
            if pos < front.start {
                return 0.0;
            }
            let idx = (pos - front.start) as usize;
            if let Some(&sample) = front.samples.get(idx) {
                return sample;
            }
            self.queue.pop_front();
        }
        0.0
    }

    /// Buffers not fully played yet
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.tail = self.cursor;
    }
}

#[cfg(feature = "device")]
pub use self::device::{list_output_devices, DevicePlayback};

#[cfg(feature = "device")]
mod device {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, Stream, StreamConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;

    use super::{PcmBuffer, PlaybackSink, Timeline};
    use crate::audio::codec::pcm_to_f32;
    use crate::audio::dsp::{resample, to_i16_sample, to_u16_sample};
    use crate::error::{LiveError, Result};

    /// List available output devices
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to enumerate output devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Speaker output using cpal, clocked by rendered frames
    pub struct DevicePlayback {
        stream: Option<Stream>,
        timeline: Arc<Mutex<Timeline>>,
        device_rate: u32,
    }

    // Safety: the stream is only touched from the owning session under its lock
    unsafe impl Send for DevicePlayback {}

    impl DevicePlayback {
        /// Acquire an output device by name, or the default one, and start it
        pub fn open(device_name: Option<&str>) -> Result<Self> {
            let host = cpal::default_host();
            let device = match device_name {
                Some(name) => host
                    .output_devices()
                    .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to enumerate devices: {}", e)))?
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| LiveError::DeviceUnavailable(format!("Device '{}' not found", name)))?,
                None => host
                    .default_output_device()
                    .ok_or_else(|| LiveError::DeviceUnavailable("No default output device".to_string()))?,
            };

            tracing::info!("Using output device: {}", device.name().unwrap_or_default());

            let supported_config = device
                .default_output_config()
                .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to get output config: {}", e)))?;
            let config = supported_config.config();
            let device_rate = config.sample_rate.0;

            tracing::info!(
                "Using playback config: {} Hz, {} channels, {:?}",
                device_rate,
                config.channels,
                supported_config.sample_format()
            );

            let timeline = Arc::new(Mutex::new(Timeline::new(device_rate)));

            let stream = match supported_config.sample_format() {
                SampleFormat::F32 => build::<f32, _>(&device, &config, timeline.clone(), |s| s),
                SampleFormat::I16 => build::<i16, _>(&device, &config, timeline.clone(), to_i16_sample),
                SampleFormat::U16 => build::<u16, _>(&device, &config, timeline.clone(), to_u16_sample),
                format => {
                    return Err(LiveError::DeviceUnavailable(format!(
                        "Unsupported sample format: {:?}",
                        format
                    )));
                }
            }?;

            stream
                .play()
                .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to start playback: {}", e)))?;

            tracing::info!("Audio playback started at {} Hz", device_rate);

            Ok(Self {
                stream: Some(stream),
                timeline,
                device_rate,
            })
        }
    }

    /// Output stream that renders the timeline in f32 and converts to the device format
    fn build<T, C>(
        device: &Device,
        config: &StreamConfig,
        timeline: Arc<Mutex<Timeline>>,
        convert: C,
    ) -> Result<Stream>
    where
        T: cpal::SizedSample,
        C: Fn(f32) -> T + Send + 'static,
    {
        let channels = config.channels as usize;
        let mut scratch: Vec<f32> = Vec::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    timeline.lock().render(&mut scratch, channels);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = convert(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| LiveError::DeviceUnavailable(format!("Failed to build output stream: {}", e)))
    }

    impl PlaybackSink for DevicePlayback {
        fn current_time(&self) -> f64 {
            self.timeline.lock().current_time()
        }

        fn schedule(&mut self, start_at: f64, buffer: PcmBuffer) {
            let samples = pcm_to_f32(&buffer.samples);
            let samples = if buffer.sample_rate == self.device_rate {
                samples
            } else {
                resample(&samples, self.device_rate as f64 / buffer.sample_rate.max(1) as f64)
            };
            self.timeline.lock().schedule(start_at, samples);
        }

        fn close(&mut self) {
            if self.stream.take().is_some() {
                self.timeline.lock().clear();
                tracing::info!("Audio playback stopped");
            }
        }
    }

    impl Drop for DevicePlayback {
        fn drop(&mut self) {
            self.close();
        }
    }
}
