//! Connection health monitoring
//!
//! ICE failures are answered with an ICE restart. Disconnects start a single
//! grace timer per link; recovering before it fires cancels it, expiry while
//! still unhealthy tears the link down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::peer::IceConnectionState;
use crate::models::ParticipantId;

/// What the coordinator should do after an ICE state change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleAction {
    pub restart_ice: bool,
    pub start_grace_timer: bool,
    pub cancel_grace_timer: bool,
}

impl LifecycleAction {
    /// Decide the reaction to `state`; `timer_running` reflects the link's timer
    #[must_use]
    pub const fn for_state(state: IceConnectionState, timer_running: bool) -> Self {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => Self {
                restart_ice: false,
                start_grace_timer: false,
                cancel_grace_timer: timer_running,
            },
            // restart now, but still prune the link if it never comes back
            IceConnectionState::Failed => Self {
                restart_ice: true,
                start_grace_timer: !timer_running,
                cancel_grace_timer: false,
            },
            IceConnectionState::Disconnected | IceConnectionState::Closed => Self {
                restart_ice: false,
                start_grace_timer: !timer_running,
                cancel_grace_timer: false,
            },
            IceConnectionState::New | IceConnectionState::Checking => Self {
                restart_ice: false,
                start_grace_timer: false,
                cancel_grace_timer: false,
            },
        }
    }

    #[must_use]
    pub const fn is_noop(&self) -> bool {
        !self.restart_ice && !self.start_grace_timer && !self.cancel_grace_timer
    }
}

/// Grace timer expiry delivered to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceExpired {
    pub peer: ParticipantId,
    pub generation: u64,
    pub timer_id: u64,
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Pending cleanup for one link. Dropping the handle does not cancel it;
/// call [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct GraceTimer {
    id: u64,
    task: JoinHandle<()>,
}

impl GraceTimer {
    pub fn start(
        peer: ParticipantId,
        generation: u64,
        delay: Duration,
        tx: mpsc::UnboundedSender<GraceExpired>,
    ) -> Self {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(GraceExpired {
                peer,
                generation,
                timer_id: id,
            });
        });
        Self { id, task }
    }

    /// Unique per timer; matches [`GraceExpired::timer_id`]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
