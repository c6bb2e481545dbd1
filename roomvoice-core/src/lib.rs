pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod models;
pub mod voice;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{CaptureError, Error, Result};
pub use models::{Identity, ParticipantId, Profile, RoomName, VoiceParticipant};
pub use voice::{SessionDeps, SessionStats, VoiceSession};
