//! Actor runtime for Weave.
//!
//! An actor is a piece of state plus a handler for one closed message type.
//! Messages posted to an actor queue in its [`Mailbox`]; the [`Runtime`]
//! admits at most one run of a given actor at a time onto a fixed-size
//! [`WorkerPool`], so a handler never executes concurrently with itself.
//!
//! ## Module structure
//!
//! - [`mailbox`]: FIFO envelope queue
//! - [`pool`]: fixed-size worker threads
//! - [`runtime`]: admission, dispatch, [`Addr`] and [`Context`]

pub mod mailbox;
pub mod pool;
pub mod runtime;

pub use mailbox::Mailbox;
pub use pool::WorkerPool;
pub use runtime::{Addr, Context, Runtime};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// ActorId
// ---------------------------------------------------------------------------

/// Opaque, process-unique actor identifier.
///
/// Allocated from a global monotonic counter; ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u64);

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

impl ActorId {
    /// Allocate a fresh actor id.
    pub fn next() -> Self {
        ActorId(NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<actor {}>", self.0)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ActorStatus
// ---------------------------------------------------------------------------

/// Scheduling status of an actor.
///
/// ```text
/// Idle --admit--> Scheduled --handler returns--> Idle
///                     |
///                     +--ctx.exit()--> Exited (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorStatus {
    /// Not queued and not running.
    Idle = 0,
    /// Admitted to the worker pool; queued or currently running.
    Scheduled = 1,
    /// Terminated. New posts are rejected.
    Exited = 2,
}

impl ActorStatus {
    pub(crate) fn from_u8(v: u8) -> ActorStatus {
        match v {
            0 => ActorStatus::Idle,
            1 => ActorStatus::Scheduled,
            _ => ActorStatus::Exited,
        }
    }
}

impl fmt::Display for ActorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorStatus::Idle => write!(f, "idle"),
            ActorStatus::Scheduled => write!(f, "scheduled"),
            ActorStatus::Exited => write!(f, "exited"),
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Behaviour of an actor.
///
/// `Message` is the actor's closed command set: each variant is one
/// selector with its typed arguments.
pub trait Actor: Send + Sized + 'static {
    /// The envelope type accepted by this actor.
    type Message: Send + 'static;

    /// Handle one envelope. Call [`Context::exit`] to terminate the actor
    /// once this call returns.
    fn handle(&mut self, msg: Self::Message, ctx: &mut Context<Self>);

    /// Called once after the actor has exited.
    fn stopped(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_id_unique() {
        let a = ActorId::next();
        let b = ActorId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_actor_id_display() {
        let id = ActorId(42);
        assert_eq!(format!("{}", id), "<actor 42>");
        assert_eq!(format!("{:?}", id), "ActorId(42)");
    }

    #[test]
    fn test_status_from_u8() {
        assert_eq!(ActorStatus::from_u8(0), ActorStatus::Idle);
        assert_eq!(ActorStatus::from_u8(1), ActorStatus::Scheduled);
        assert_eq!(ActorStatus::from_u8(2), ActorStatus::Exited);
        assert_eq!(ActorStatus::Exited.to_string(), "exited");
    }
}
