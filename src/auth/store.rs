use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::auth::session::{AuthEvent, Session, SessionState};
use crate::broadcast::Broadcaster;

/// Single source of truth for the current session.
///
/// The value is replaced as a whole behind a lock, so readers see either the old
/// or the new session. Every replacement publishes exactly one notification, and
/// it is queued before the lock is released so queue order equals transition
/// order.
pub struct SessionStore {
    current: RwLock<Arc<Session>>,
    broadcaster: Arc<Broadcaster>,
}

impl SessionStore {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Session::anonymous())),
            broadcaster,
        }
    }

    /// Current session. A signed-in session whose expiry has passed is moved to
    /// `Expired` before it is returned.
    pub fn get_session(&self) -> Arc<Session> {
        let current = self.snapshot();
        if !current.is_stale() {
            return current;
        }

        let mut slot = self.write();
        // Someone else may have replaced it in between
        if slot.is_stale() {
            debug!(generation = slot.generation(), "Session expired while held");
            self.replace(&mut slot, Session::expired(), None);
        }
        Arc::clone(&slot)
    }

    /// Current value as stored, without the expiry check
    pub fn snapshot(&self) -> Arc<Session> {
        let slot = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&slot)
    }

    /// Replace the session and notify subscribers
    pub(crate) fn set_session(&self, next: Session) -> Arc<Session> {
        let mut slot = self.write();
        self.replace(&mut slot, next, None)
    }

    /// Return to `Anonymous`
    pub(crate) fn clear(&self) -> Arc<Session> {
        self.set_session(Session::anonymous())
    }

    /// Return to `Anonymous` unless that already happened after `generation`
    pub(crate) fn clear_since(&self, generation: u64) -> Arc<Session> {
        let current = self.snapshot();
        if current.generation() != generation && current.state() == SessionState::Anonymous {
            trace!(generation = current.generation(), "Already signed out");
            return current;
        }
        self.clear()
    }

    /// Replace the session unless it already holds the same content
    pub(crate) fn apply(&self, next: Session) -> Arc<Session> {
        self.apply_tagged(next, None)
    }

    /// Like `apply`, but an authenticated result is announced as `SignedIn` even
    /// when the same user was signed in before
    pub(crate) fn apply_sign_in(&self, next: Session) -> Arc<Session> {
        self.apply_tagged(next, Some(AuthEvent::SignedIn))
    }

    fn apply_tagged(&self, next: Session, intent: Option<AuthEvent>) -> Arc<Session> {
        let mut slot = self.write();
        if slot.same_content(&next) {
            trace!(state = ?next.state(), "Session unchanged, skipping notification");
            return Arc::clone(&slot);
        }
        self.replace(&mut slot, next, intent)
    }

    /// Replace the session only if no other replacement happened since
    /// `expected_generation` was read
    pub(crate) fn set_session_if(
        &self,
        expected_generation: u64,
        next: Session,
    ) -> Option<Arc<Session>> {
        let mut slot = self.write();
        if slot.generation() != expected_generation {
            debug!(
                expected = expected_generation,
                actual = slot.generation(),
                "Session changed concurrently, dropping update"
            );
            return None;
        }
        Some(self.replace(&mut slot, next, None))
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Session>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace(
        &self,
        slot: &mut Arc<Session>,
        next: Session,
        intent: Option<AuthEvent>,
    ) -> Arc<Session> {
        let next = if next.is_stale() {
            Session::expired()
        } else {
            next
        };
        let next = Arc::new(next.with_generation(slot.generation() + 1));
        let event = match intent {
            Some(event) if next.state() == SessionState::Authenticated => event,
            _ => AuthEvent::from_transition(&**slot, &next),
        };

        debug!(
            from = ?slot.state(),
            to = ?next.state(),
            event = ?event,
            generation = next.generation(),
            "Session replaced"
        );

        *slot = Arc::clone(&next);
        self.broadcaster.publish(event, Arc::clone(&next));
        next
    }
}
