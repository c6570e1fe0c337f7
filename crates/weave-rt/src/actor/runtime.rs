//! Admission and dispatch of actor runs.
//!
//! Every spawned actor lives in a shared cell holding its status word, its
//! mailbox and its state. Posting pushes onto the mailbox and then tries to
//! move the status from `Idle` to `Scheduled`; only the thread that wins
//! that compare-and-swap submits a run to the worker pool. A run handles
//! exactly one envelope and then either exits the actor or drops it back
//! to `Idle`, re-admitting it if more mail arrived in the meantime.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::{Actor, ActorId, ActorStatus, Mailbox, WorkerPool};

const IDLE: u8 = ActorStatus::Idle as u8;
const SCHEDULED: u8 = ActorStatus::Scheduled as u8;
const EXITED: u8 = ActorStatus::Exited as u8;

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

struct RuntimeInner {
    pool: WorkerPool,
}

/// Dispatcher owning the worker pool that runs actor handlers.
///
/// Cloning is cheap; all clones share one pool.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// Create a runtime with `workers` pool threads (0 = available cores).
    pub fn new(workers: usize) -> Self {
        let pool = WorkerPool::new(workers, "weave-worker");
        debug!(workers = pool.size(), "runtime started");
        Runtime {
            inner: Arc::new(RuntimeInner { pool }),
        }
    }

    /// The lazily-initialised process-wide runtime.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(|| Runtime::new(0))
    }

    /// Spawn an actor. It starts `Idle` with an empty mailbox.
    pub fn spawn<A: Actor>(&self, actor: A) -> Addr<A> {
        let cell = Arc::new(Cell {
            id: ActorId::next(),
            status: CachePadded::new(AtomicU8::new(IDLE)),
            mailbox: Mailbox::new(),
            actor: Mutex::new(actor),
            runtime: Arc::clone(&self.inner),
        });
        debug!(actor = cell.id.0, "actor spawned");
        Addr { cell }
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.inner.pool.size()
    }

    /// Stop the worker pool. Queued runs finish; later admissions are
    /// refused.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.inner.pool)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

struct Cell<A: Actor> {
    id: ActorId,
    status: CachePadded<AtomicU8>,
    mailbox: Mailbox<A::Message>,
    actor: Mutex<A>,
    runtime: Arc<RuntimeInner>,
}

impl<A: Actor> Cell<A> {
    fn status(&self) -> ActorStatus {
        ActorStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

/// Try to admit the actor. Only the `Idle -> Scheduled` winner submits.
fn schedule<A: Actor>(cell: &Arc<Cell<A>>) {
    if cell
        .status
        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let job_cell = Arc::clone(cell);
    if !cell.runtime.pool.submit(Box::new(move || run(job_cell))) {
        warn!(actor = cell.id.0, "runtime shut down, actor not scheduled");
        cell.status.store(IDLE, Ordering::Release);
    }
}

/// Handle exactly one envelope.
fn run<A: Actor>(cell: Arc<Cell<A>>) {
    let Some(msg) = cell.mailbox.pop() else {
        cell.status.store(IDLE, Ordering::Release);
        if !cell.mailbox.is_empty() {
            schedule(&cell);
        }
        return;
    };

    let mut ctx = Context {
        addr: Addr {
            cell: Arc::clone(&cell),
        },
        exit_requested: false,
    };

    let outcome = {
        let mut actor = cell.actor.lock();
        catch_unwind(AssertUnwindSafe(|| actor.handle(msg, &mut ctx)))
    };
    if let Err(payload) = outcome {
        error!(
            actor = cell.id.0,
            panic = %panic_message(payload.as_ref()),
            "actor handler panicked"
        );
    }

    if ctx.exit_requested {
        cell.status.store(EXITED, Ordering::Release);
        let dropped = cell.mailbox.clear();
        cell.actor.lock().stopped();
        debug!(actor = cell.id.0, dropped, "actor exited");
    } else {
        cell.status.store(IDLE, Ordering::Release);
        if !cell.mailbox.is_empty() {
            schedule(&cell);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Addr
// ---------------------------------------------------------------------------

/// Handle used to post envelopes to an actor.
pub struct Addr<A: Actor> {
    cell: Arc<Cell<A>>,
}

impl<A: Actor> Addr<A> {
    /// Post an envelope.
    ///
    /// Returns `false` without queuing anything if the actor has exited.
    pub fn post(&self, msg: A::Message) -> bool {
        if self.cell.status() == ActorStatus::Exited {
            return false;
        }
        self.cell.mailbox.push(msg);
        if self.cell.status() == ActorStatus::Exited {
            // Lost the race with exit; nothing will ever drain this.
            self.cell.mailbox.clear();
            return false;
        }
        schedule(&self.cell);
        true
    }

    pub fn id(&self) -> ActorId {
        self.cell.id
    }

    pub fn status(&self) -> ActorStatus {
        self.cell.status()
    }

    pub fn is_exited(&self) -> bool {
        self.status() == ActorStatus::Exited
    }

    /// Number of envelopes waiting in the mailbox.
    pub fn pending(&self) -> usize {
        self.cell.mailbox.len()
    }
}

impl<A: Actor> Clone for Addr<A> {
    fn clone(&self) -> Self {
        Addr {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: Actor> fmt::Debug for Addr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("id", &self.cell.id)
            .field("status", &self.cell.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-run context passed to [`Actor::handle`].
pub struct Context<A: Actor> {
    addr: Addr<A>,
    exit_requested: bool,
}

impl<A: Actor> Context<A> {
    /// Address of the running actor.
    pub fn addr(&self) -> Addr<A> {
        self.addr.clone()
    }

    pub fn id(&self) -> ActorId {
        self.addr.id()
    }

    /// Terminate the actor after the current handler returns.
    pub fn exit(&mut self) {
        self.exit_requested = true;
    }

    pub fn is_exiting(&self) -> bool {
        self.exit_requested
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender};
    use std::time::Duration;

    enum CounterMsg {
        Add(u64),
        Get(Sender<u64>),
        Stop,
        Panic,
    }

    struct Counter {
        total: u64,
        stopped_tx: Option<Sender<()>>,
    }

    impl Actor for Counter {
        type Message = CounterMsg;

        fn handle(&mut self, msg: CounterMsg, ctx: &mut Context<Self>) {
            match msg {
                CounterMsg::Add(n) => self.total += n,
                CounterMsg::Get(reply) => {
                    let _ = reply.send(self.total);
                }
                CounterMsg::Stop => ctx.exit(),
                CounterMsg::Panic => panic!("handler failure"),
            }
        }

        fn stopped(&mut self) {
            if let Some(tx) = self.stopped_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn get(addr: &Addr<Counter>) -> u64 {
        let (tx, rx) = crossbeam_channel::bounded(1);
        assert!(addr.post(CounterMsg::Get(tx)));
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn counter(rt: &Runtime) -> (Addr<Counter>, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let addr = rt.spawn(Counter {
            total: 0,
            stopped_tx: Some(tx),
        });
        (addr, rx)
    }

    #[test]
    fn test_spawned_actor_starts_idle() {
        let rt = Runtime::new(2);
        let (addr, _stopped) = counter(&rt);
        assert_eq!(addr.status(), ActorStatus::Idle);
        assert_eq!(addr.pending(), 0);
        assert!(!addr.is_exited());
    }

    #[test]
    fn test_messages_are_handled_in_order() {
        let rt = Runtime::new(4);
        let (addr, _stopped) = counter(&rt);
        for n in 1..=100 {
            assert!(addr.post(CounterMsg::Add(n)));
        }
        assert_eq!(get(&addr), 5050);
    }

    #[test]
    fn test_exit_rejects_later_posts() {
        let rt = Runtime::new(2);
        let (addr, stopped) = counter(&rt);
        addr.post(CounterMsg::Add(1));
        addr.post(CounterMsg::Stop);
        stopped.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(addr.is_exited());
        assert!(!addr.post(CounterMsg::Add(1)));
        assert_eq!(addr.pending(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stall_actor() {
        let rt = Runtime::new(1);
        let (addr, _stopped) = counter(&rt);
        addr.post(CounterMsg::Add(2));
        addr.post(CounterMsg::Panic);
        addr.post(CounterMsg::Add(3));
        assert_eq!(get(&addr), 5);
        assert_ne!(addr.status(), ActorStatus::Exited);
    }

    #[test]
    fn test_context_addr_is_self() {
        struct Echo;
        impl Actor for Echo {
            type Message = Sender<ActorId>;
            fn handle(&mut self, reply: Sender<ActorId>, ctx: &mut Context<Self>) {
                assert_eq!(ctx.addr().id(), ctx.id());
                let _ = reply.send(ctx.id());
            }
        }

        let rt = Runtime::new(1);
        let addr = rt.spawn(Echo);
        let (tx, rx) = crossbeam_channel::bounded(1);
        addr.post(tx);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), addr.id());
    }

    #[test]
    fn test_post_after_runtime_shutdown_does_not_panic() {
        let rt = Runtime::new(1);
        let (addr, _stopped) = counter(&rt);
        rt.shutdown();
        assert!(addr.post(CounterMsg::Add(1)));
        assert_eq!(addr.status(), ActorStatus::Idle);
    }

    #[test]
    fn test_global_runtime_is_shared() {
        let a = Runtime::global();
        let b = Runtime::global();
        assert!(std::ptr::eq(a, b));
        assert!(a.workers() >= 1);

        let (addr, _stopped) = counter(a);
        addr.post(CounterMsg::Add(9));
        assert_eq!(get(&addr), 9);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
