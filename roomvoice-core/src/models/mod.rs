pub mod id;
pub mod participant;

pub use id::{generate_id, ParticipantId, RoomName};
pub use participant::{Identity, Profile, VoiceParticipant};
