//! Global volume key interception.
//!
//! Decodes system-defined media key events, swallows volume up/down/mute and
//! redirects them to both merged endpoints.

pub mod keys;
pub mod tap;

pub use keys::{classify, KeyInterceptor, MediaKey, TapEvent, TapVerdict, VOLUME_STEP};
pub use tap::{EventTap, KeySink, SimulatedTap, SimulatedTapControl, TapError, TapStop};
