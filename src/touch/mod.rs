//! Touch recording and script playback against a live device.
//!
//! Grounded in the event recorder's own `getevent`-piping and tap
//! classification, generalized from "print what happened" to "produce a
//! replayable `TouchScript`" per the recorder/player split.

mod player;
mod recorder;

pub use player::{PlaybackHandle, ScriptPlayer};
pub use recorder::{FirstCandidate, RecordMode, RecorderHandle, SelectorPrompt, TouchRecorder};
