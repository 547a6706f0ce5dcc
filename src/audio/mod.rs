mod backend;
mod capture;
pub mod codec;
mod dsp;
mod playback;

pub use backend::AudioBackend;
pub use capture::{CaptureSource, FrameAssembler, FrameCallback};
pub use codec::AudioPayload;
pub use dsp::{calculate_rms, resample, rms_to_level, to_i16_sample, to_u16_sample};
pub use playback::{PcmBuffer, PlaybackScheduler, PlaybackSink, Timeline};

#[cfg(feature = "device")]
pub use backend::CpalBackend;
#[cfg(feature = "device")]
pub use capture::{list_input_devices, DeviceCapture};
#[cfg(feature = "device")]
pub use playback::{list_output_devices, DevicePlayback};

/// Microphone rate expected by the remote model
pub const INPUT_SAMPLE_RATE: u32 = 16000;
/// Rate of the audio the remote model speaks back
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;
/// Samples per captured frame (~256ms at 16kHz)
pub const FRAME_SIZE: usize = 4096;
