use std::collections::HashMap;

use super::peer::PeerLink;
use crate::models::{Identity, ParticipantId, VoiceParticipant};

/// The local participant's contribution to the list
#[derive(Debug, Clone, Copy)]
pub struct LocalView<'a> {
    pub identity: &'a Identity,
    pub muted: bool,
    pub has_stream: bool,
}

/// Derive the participant list: local first, then remote links by id.
///
/// Remote mute state is not signaled, so remote rows always report unmuted.
/// A remote without a known profile is shown under its id.
pub fn project<'a>(
    local: Option<LocalView<'_>>,
    links: impl IntoIterator<Item = &'a PeerLink>,
    speaking: &HashMap<ParticipantId, bool>,
) -> Vec<VoiceParticipant> {
    let is_speaking = |id: &ParticipantId| speaking.get(id).copied().unwrap_or(false);
    let mut participants = Vec::new();

    if let Some(local) = local {
        let id = &local.identity.id;
        participants.push(VoiceParticipant {
            id: id.clone(),
            name: local.identity.name.clone(),
            avatar: local.identity.avatar.clone(),
            // a muted microphone cannot be speaking
            is_speaking: !local.muted && is_speaking(id),
            is_muted: local.muted,
            has_stream: local.has_stream,
        });
    }

    let mut remotes: Vec<_> = links
        .into_iter()
        .map(|link| {
            let (name, avatar) = link.profile.as_ref().map_or_else(
                || (link.remote_id.to_string(), None),
                |p| (p.name.clone(), p.avatar.clone()),
            );
            VoiceParticipant {
                id: link.remote_id.clone(),
                name,
                avatar,
                is_speaking: is_speaking(&link.remote_id),
                is_muted: false,
                has_stream: link.has_stream(),
            }
        })
        .collect();
    remotes.sort_by(|a, b| a.id.cmp(&b.id));
    participants.extend(remotes);
    participants
}
