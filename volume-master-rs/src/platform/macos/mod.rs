//! macOS implementations of the audio, key tap and window seams.

mod coreaudio;
mod event_tap;
mod windows;

pub use coreaudio::CoreAudioBackend;
pub use event_tap::QuartzEventTap;
pub use windows::QuartzWindows;
