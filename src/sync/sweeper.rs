//! Idle sweeper.
//!
//! Periodically walks every room and demotes participants whose last
//! activity is older than the idle or offline threshold. A failure while
//! sweeping one room is logged and never stops the sweep of the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::presence::IdlePolicy;
use crate::room::RoomRegistry;

/// Applies the idle policy to all rooms
pub struct IdleSweeper {
    registry: Arc<RoomRegistry>,
    policy: IdlePolicy,
}

impl IdleSweeper {
    pub fn new(registry: Arc<RoomRegistry>, policy: IdlePolicy) -> Self {
        Self { registry, policy }
    }

    /// Run one pass over every room. Returns the number of status transitions.
    pub fn sweep(&self) -> usize {
        let mut transitions = 0;
        for room_id in self.registry.room_ids() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.registry.demote_idle(&room_id, &self.policy)
            }));
            match result {
                Ok(count) => transitions += count,
                Err(_) => error!("Idle sweep of room {} panicked, skipping", room_id),
            }
        }
        transitions
    }

    /// Sweep every `period` until `shutdown` fires
    pub fn spawn(self, period: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let transitions = self.sweep();
                        if transitions > 0 {
                            debug!("Idle sweep applied {} status changes", transitions);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Idle sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::clock::ManualClock;
    use crate::room::Room;
    use crate::sync::presence::test_support::{Recorded, RecordingSink};
    use crate::sync::presence::{
        Cursor, Participant, PresenceSink, PresenceStatus, StatusCause,
    };
    use uuid::Uuid;

    fn setup() -> (Arc<RoomRegistry>, Arc<RecordingSink>, Arc<ManualClock>) {
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(RoomRegistry::new(sink.clone(), clock.clone()));
        (registry, sink, clock)
    }

    fn identity(user: &str) -> Identity {
        Identity::new(user, format!("{}@example.com", user))
    }

    fn status_of(registry: &RoomRegistry, room: &str, user: &str) -> PresenceStatus {
        registry
            .snapshot(room)
            .and_then(|roster| roster.into_iter().find(|p| p.user_id == user))
            .map(|p| p.status)
            .unwrap()
    }

    #[test]
    fn test_idle_then_offline_then_back() {
        let (registry, sink, clock) = setup();
        let sweeper = IdleSweeper::new(registry.clone(), IdlePolicy::default());
        registry.join("r1", &identity("alice"), Uuid::new_v4());
        sink.take();

        clock.advance_minutes(6);
        assert_eq!(sweeper.sweep(), 1);
        assert_eq!(status_of(&registry, "r1", "alice"), PresenceStatus::Idle);

        clock.advance_minutes(25);
        assert_eq!(sweeper.sweep(), 1);
        assert_eq!(status_of(&registry, "r1", "alice"), PresenceStatus::Offline);

        // A later sweep with no new activity changes nothing
        assert_eq!(sweeper.sweep(), 0);

        assert!(registry.update_cursor("r1", "alice", Cursor::new(5.0, 5.0)));
        assert_eq!(status_of(&registry, "r1", "alice"), PresenceStatus::Active);

        assert_eq!(
            sink.take(),
            vec![
                Recorded::Status("r1".into(), "alice".into(), PresenceStatus::Idle, StatusCause::Sweep),
                Recorded::Status("r1".into(), "alice".into(), PresenceStatus::Offline, StatusCause::Sweep),
                Recorded::Status("r1".into(), "alice".into(), PresenceStatus::Active, StatusCause::Activity),
                Recorded::Cursor("r1".into(), "alice".into()),
            ]
        );
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let (registry, _, clock) = setup();
        let sweeper = IdleSweeper::new(registry.clone(), IdlePolicy::default());
        registry.join("r1", &identity("alice"), Uuid::new_v4());

        clock.advance(Duration::from_secs(5 * 60 - 1));
        assert_eq!(sweeper.sweep(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(sweeper.sweep(), 1);
    }

    /// Panics on status events for one room, records the rest
    struct FaultySink {
        inner: RecordingSink,
        broken_room: &'static str,
    }

    impl PresenceSink for FaultySink {
        fn on_join(&self, room: &Room, participant: &Participant) {
            self.inner.on_join(room, participant);
        }

        fn on_leave(&self, room: &Room, user_id: &str) {
            self.inner.on_leave(room, user_id);
        }

        fn on_cursor(&self, room: &Room, participant: &Participant) {
            self.inner.on_cursor(room, participant);
        }

        fn on_status(&self, room: &Room, participant: &Participant, cause: StatusCause) {
            if room.id() == self.broken_room {
                panic!("sink failure in {}", room.id());
            }
            self.inner.on_status(room, participant, cause);
        }
    }

    #[test]
    fn test_fault_in_one_room_does_not_stop_others() {
        let sink = Arc::new(FaultySink {
            inner: RecordingSink::default(),
            broken_room: "broken",
        });
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(RoomRegistry::new(sink.clone(), clock.clone()));
        let sweeper = IdleSweeper::new(registry.clone(), IdlePolicy::default());

        registry.join("broken", &identity("alice"), Uuid::new_v4());
        registry.join("healthy", &identity("bob"), Uuid::new_v4());
        sink.inner.take();

        clock.advance_minutes(6);
        assert_eq!(sweeper.sweep(), 1);
        assert_eq!(status_of(&registry, "healthy", "bob"), PresenceStatus::Idle);
        assert_eq!(
            sink.inner.take(),
            vec![Recorded::Status("healthy".into(), "bob".into(), PresenceStatus::Idle, StatusCause::Sweep)]
        );

        // The faulty room is still usable afterwards
        assert!(registry.leave("broken", "alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_until_shutdown() {
        let (registry, sink, clock) = setup();
        registry.join("r1", &identity("alice"), Uuid::new_v4());
        sink.take();
        clock.advance_minutes(6);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = IdleSweeper::new(registry.clone(), IdlePolicy::default())
            .spawn(Duration::from_secs(60), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(status_of(&registry, "r1", "alice"), PresenceStatus::Idle);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
