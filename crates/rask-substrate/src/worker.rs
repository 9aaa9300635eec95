// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Workers and stack switching.
//!
//! A worker is one OS thread's share of the runtime: a fixed system stack
//! the scheduler runs on, an optional fault stack for signal handlers, the
//! task it is currently running and a private PRNG. Control moves between
//! three kinds of stack:
//!
//! ```text
//!   host thread --run--> system stack --resume--> task stack
//!        ^                  |    ^                    |
//!        +------exit--------+    +--switch / system---+
//! ```
//!
//! Every entry onto the system stack starts a fresh frame at its top: the
//! system stack holds nothing across a task's run. A call posted by the
//! task side waits in `pending` until the fresh frame picks it up.
//!
//! The functions here that switch stacks and later continue never log
//! directly. A task may continue on another OS thread, and anything that
//! cached thread-local state before the switch would be stale after it, so
//! logging goes through out-of-line helpers.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use crate::arch;
use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::error::{fatal, SetupError, Violation};
use crate::frames::{FrameStack, GrowthReport};
use crate::rand::FastRand;
use crate::stack::{OwnedStack, StackAllocator};
use crate::task::{panic_message, Task, TaskRef, TaskState};

/// Scheduler entry point. Runs on the system stack and leaves it only by
/// resuming a task or exiting the worker.
///
/// Each call starts on a fresh frame at the top of the system stack and
/// that frame is abandoned by `resume` or `exit`, so owned locals still
/// alive at that point are never dropped. Drop them (or let them end in an
/// inner scope) before leaving.
pub type ScheduleFn = fn(&mut Worker) -> !;

/// Which stack an address belongs to, from one worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// The native stack of the worker's current task.
    Task,
    System,
    Fault,
    /// Anything else, normally the OS thread's own stack.
    Host,
}

/// What a suspending task leaves for the scheduler.
#[derive(Debug)]
pub enum Handoff {
    Yield(TaskRef),
    Park(TaskRef),
    Exit(TaskRef),
}

impl Handoff {
    pub fn task(&self) -> &TaskRef {
        match self {
            Handoff::Yield(t) | Handoff::Park(t) | Handoff::Exit(t) => t,
        }
    }

    pub fn into_task(self) -> TaskRef {
        match self {
            Handoff::Yield(t) | Handoff::Park(t) | Handoff::Exit(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks resumed.
    pub switches: u64,
    /// Entries onto the system stack from a task or the host.
    pub system_calls: u64,
    /// Frame-stack growths performed.
    pub growths: u64,
}

struct PendingCall {
    data: *mut u8,
    run: unsafe fn(*mut u8, *mut Worker) -> !,
}

pub struct Worker {
    id: usize,
    config: RuntimeConfig,
    allocator: Arc<dyn StackAllocator>,
    system_stack: OwnedStack,
    fault_stack: Option<OwnedStack>,
    host: ExecutionContext,
    current: Option<TaskRef>,
    rng: FastRand,
    pending: Option<PendingCall>,
    /// Where a finished system-stack call continues.
    system_return: *mut ExecutionContext,
    in_system_call: bool,
    handoff: Option<Handoff>,
    schedule: Option<ScheduleFn>,
    attachment: Option<Box<dyn Any + Send>>,
    stats: WorkerStats,
    running: bool,
}

impl Worker {
    /// Validate `config` and allocate the worker's stacks. Aborts if the
    /// register primitives fail their self-check on this machine.
    pub fn new(
        id: usize,
        config: RuntimeConfig,
        allocator: Arc<dyn StackAllocator>,
    ) -> Result<Worker, SetupError> {
        config.validate()?;
        if let Err(v) = arch::check() {
            fatal(v);
        }
        let system_stack = OwnedStack::new(allocator.clone(), config.system_stack_size)?;
        let fault_stack = match config.fault_stack_size {
            0 => None,
            size => Some(OwnedStack::new(allocator.clone(), size)?),
        };
        let rng = match config.rng_seed {
            Some(seed) => FastRand::for_worker_seeded(id, seed),
            None => FastRand::for_worker(id),
        };
        Ok(Worker {
            id,
            config,
            allocator,
            system_stack,
            fault_stack,
            host: ExecutionContext::default(),
            current: None,
            rng,
            pending: None,
            system_return: ptr::null_mut(),
            in_system_call: false,
            handoff: None,
            schedule: None,
            attachment: None,
            stats: WorkerStats::default(),
            running: false,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// A task that uses this worker's configuration and allocator.
    pub fn spawn<F>(&self, entry: F) -> Result<TaskRef, SetupError>
    where
        F: FnOnce(&mut crate::task::TaskCx) + Send + 'static,
    {
        TaskRef::spawn(&self.config, self.allocator.clone(), entry)
    }

    pub fn current_task(&self) -> Option<&TaskRef> {
        self.current.as_ref()
    }

    /// Classify `sp` against this worker's stacks.
    pub fn stack_kind(&self, sp: usize) -> StackKind {
        if self.current.as_ref().is_some_and(|t| t.native.contains(sp)) {
            StackKind::Task
        } else if self.system_stack.contains(sp) {
            StackKind::System
        } else if self.fault_stack.as_ref().is_some_and(|s| s.contains(sp)) {
            StackKind::Fault
        } else {
            StackKind::Host
        }
    }

    /// Store scheduler state on the worker, replacing any previous value.
    pub fn attach<T: Any + Send>(&mut self, value: T) {
        self.attachment = Some(Box::new(value));
    }

    pub fn attachment<T: Any>(&self) -> Option<&T> {
        self.attachment.as_deref()?.downcast_ref::<T>()
    }

    pub fn fastrand(&mut self) -> u32 {
        self.rng.fastrand()
    }

    pub fn fastrandn(&mut self, n: u32) -> u32 {
        self.rng.fastrandn(n)
    }

    /// Reseed the worker's generator deterministically.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = FastRand::for_worker_seeded(self.id, seed);
    }

    /// Leave a command for the scheduler. Only one may be pending.
    pub fn post(&mut self, handoff: Handoff) {
        if self.handoff.is_some() {
            fatal(Violation::HandoffPending);
        }
        self.handoff = Some(handoff);
    }

    pub fn take_handoff(&mut self) -> Option<Handoff> {
        self.handoff.take()
    }

    /// Enter the system stack from this OS thread and run `schedule` there.
    /// Returns once the scheduler calls [`exit`](Self::exit).
    pub fn run(&mut self, schedule: ScheduleFn) {
        if self.running {
            fatal(Violation::WorkerReentered { worker: self.id });
        }
        self.running = true;
        self.schedule = Some(schedule);
        let previous = self.install_fault_stack();
        log_enter(self.id);

        let this: *mut Worker = self;
        // SAFETY: the system stack is idle (the worker was not running), and
        // `self` stays borrowed, so the worker does not move until `exit`
        // jumps back into `host`.
        unsafe {
            (*this).pending = Some(PendingCall {
                data: ptr::null_mut(),
                run: schedule_shim,
            });
            let entry = ExecutionContext::entry((*this).system_stack.top(), system_entry, this as usize);
            arch::swap(ptr::addr_of_mut!((*this).host), &entry);
        }

        self.restore_fault_stack(previous);
        self.running = false;
        log_leave(self.id, self.stats);
    }

    /// Return to the OS thread that called [`run`](Self::run). Like
    /// [`resume`](Self::resume), this abandons the calling frame without
    /// dropping its locals.
    pub fn exit(&mut self) -> ! {
        self.require_system("exit");
        if let Some(task) = &self.current {
            fatal(Violation::WorkerBusy {
                worker: self.id,
                running: task.id(),
            });
        }
        // SAFETY: `run` saved `host` and is suspended waiting for it.
        unsafe { arch::jump(&self.host) }
    }

    /// Call the schedule entry point again.
    pub fn reschedule(&mut self) -> ! {
        self.require_system("reschedule");
        match self.schedule {
            Some(schedule) => schedule(self),
            None => fatal(Violation::NoScheduler { worker: self.id }),
        }
    }

    /// Continue `task` on this worker. Only from the system stack, with no
    /// task current and no system-stack call in flight.
    ///
    /// The calling frame is abandoned, not unwound: values the caller still
    /// owns (an `Arc` clone, a lock guard) leak unless dropped first.
    pub fn resume(&mut self, mut task: TaskRef) -> ! {
        self.require_system("resume");
        if let Some(current) = &self.current {
            fatal(Violation::WorkerBusy {
                worker: self.id,
                running: current.id(),
            });
        }
        if !matches!(task.state, TaskState::Runnable | TaskState::Suspended) || !task.context.is_resumable() {
            fatal(Violation::NotResumable {
                task: task.id(),
                state: task.state.name(),
            });
        }
        task.worker = self;
        task.last_worker = Some(self.id);
        task.state = TaskState::Running;
        task.context.resumable = false;
        let ctx: *const ExecutionContext = &task.context;
        self.stats.switches += 1;
        log_resume(self.id, task.id());
        self.current = Some(task);
        // SAFETY: the context was produced by `spawn` or a task-side switch
        // and the task's stacks are alive; the task now belongs to
        // `self.current`, which keeps the context in place.
        unsafe { arch::jump(ctx) }
    }

    /// Run `f` on the system stack. From the system or fault stack `f` runs
    /// in place; from the current task's stack or the host thread the
    /// worker switches over and back.
    pub fn run_on_system_stack<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Worker) -> R,
    {
        let this: *mut Worker = self;
        match self.stack_kind(arch::current_sp()) {
            StackKind::System | StackKind::Fault => f(self),
            StackKind::Task => {
                let task = self.current.as_ref().map(TaskRef::as_ptr).unwrap_or_else(|| {
                    fatal(Violation::WrongStack {
                        op: "run_on_system_stack",
                        found: StackKind::Task,
                    })
                });
                // SAFETY: the current task is running on this stack, so its
                // context slot is free to hold our continuation.
                unsafe { system_call(this, ptr::addr_of_mut!((*task).context), f) }
            }
            StackKind::Host => {
                if self.running {
                    fatal(Violation::WorkerReentered { worker: self.id });
                }
                let mut home = ExecutionContext::default();
                // SAFETY: the worker is not running, so its system stack is
                // idle; `home` outlives the call.
                unsafe { system_call(this, &mut home, f) }
            }
        }
    }

    /// Grow `frames` by at least `needed` bytes. Runs on the system stack,
    /// normally inside a system-stack call, and the stack must still have
    /// `system_headroom` bytes free.
    pub fn grow_frames(&mut self, frames: &mut FrameStack, needed: usize) -> GrowthReport {
        let sp = arch::current_sp();
        let found = self.stack_kind(sp);
        if found != StackKind::System {
            fatal(Violation::WrongStack {
                op: "grow_frames",
                found,
            });
        }
        let remaining = sp.saturating_sub(self.system_stack.region().lo);
        if remaining < self.config.system_headroom {
            fatal(Violation::SystemStackExhausted {
                remaining,
                headroom: self.config.system_headroom,
            });
        }
        let report = frames.grow(needed).unwrap_or_else(|v| fatal(v));
        self.stats.growths += 1;
        report
    }

    fn require_system(&self, op: &'static str) {
        let found = self.stack_kind(arch::current_sp());
        if found != StackKind::System {
            fatal(Violation::WrongStack { op, found });
        }
        if self.in_system_call {
            fatal(Violation::NestedSystemCall { op });
        }
    }

    fn install_fault_stack(&self) -> Option<libc::stack_t> {
        let region = self.fault_stack.as_ref()?.region();
        let new = libc::stack_t {
            ss_sp: region.lo as *mut libc::c_void,
            ss_flags: 0,
            ss_size: region.size(),
        };
        // SAFETY: stack_t is plain data; all-zero is a valid value.
        let mut old: libc::stack_t = unsafe { std::mem::zeroed() };
        // SAFETY: the fault stack outlives the run; `old` is writable.
        if unsafe { libc::sigaltstack(&new, &mut old) } != 0 {
            tracing::warn!(worker = self.id, error = %io::Error::last_os_error(), "sigaltstack failed");
            return None;
        }
        Some(old)
    }

    fn restore_fault_stack(&self, previous: Option<libc::stack_t>) {
        if let Some(old) = previous {
            // SAFETY: restoring the thread's previous alternate stack.
            unsafe { libc::sigaltstack(&old, ptr::null_mut()) };
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("system_stack", &self.system_stack)
            .field("fault_stack", &self.fault_stack)
            .field("current", &self.current.as_ref().map(|t| t.id()))
            .field("running", &self.running)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Fresh frame at the top of the system stack: pick up the pending call.
extern "C" fn system_entry(arg: usize) -> ! {
    let worker = arg as *mut Worker;
    // SAFETY: every switch onto the system stack passes its worker, which
    // outlives the switch.
    unsafe {
        let call = match (*worker).pending.take() {
            Some(call) => call,
            None => fatal(Violation::NoPendingCall),
        };
        (*worker).stats.system_calls += 1;
        log_system_entry((*worker).id);
        (call.run)(call.data, worker)
    }
}

unsafe fn schedule_shim(_data: *mut u8, worker: *mut Worker) -> ! {
    (*worker).reschedule()
}

/// Switch from the task on `task`'s native stack to the system stack and
/// call `f` with the suspended task.
///
/// # Safety
///
/// `task` must be the running task of a live worker.
pub(crate) unsafe fn enter_from_task<F>(task: *mut Task, f: F)
where
    F: FnOnce(&mut Worker, TaskRef) -> Infallible,
{
    let worker = (*task).worker;
    let sp = arch::current_sp();
    if !(*task).native.contains(sp) {
        fatal(Violation::WrongStack {
            op: "switch_to_system_and_call",
            found: (*worker).stack_kind(sp),
        });
    }
    if (*worker).in_system_call {
        fatal(Violation::NestedSystemCall {
            op: "switch_to_system_and_call",
        });
    }
    let mut slot = Some(f);
    (*worker).pending = Some(PendingCall {
        data: ptr::addr_of_mut!(slot).cast::<u8>(),
        run: switch_shim::<F>,
    });
    (*task).state = TaskState::Suspended;
    (*task).context.resumable = true;
    let entry = ExecutionContext::entry((*worker).system_stack.top(), system_entry, worker as usize);
    arch::swap(ptr::addr_of_mut!((*task).context), &entry);
    // Resumed, possibly by another worker. Nothing read before the swap is
    // trusted past this point.
}

unsafe fn switch_shim<F>(data: *mut u8, worker: *mut Worker) -> !
where
    F: FnOnce(&mut Worker, TaskRef) -> Infallible,
{
    let f = match (*data.cast::<Option<F>>()).take() {
        Some(f) => f,
        None => fatal(Violation::NoPendingCall),
    };
    let task = match (*worker).current.take() {
        Some(task) => task,
        None => fatal(Violation::NoPendingCall),
    };
    match panic::catch_unwind(AssertUnwindSafe(move || f(&mut *worker, task))) {
        Ok(never) => match never {},
        Err(payload) => fatal(Violation::SystemPanic {
            message: panic_message(&*payload),
        }),
    }
}

struct SystemCall<F, R> {
    f: Option<F>,
    result: Option<std::thread::Result<R>>,
}

/// Run `f` on `worker`'s system stack, saving the caller into `save`.
///
/// # Safety
///
/// The system stack must be idle, and `save` must stay valid until the
/// call returns.
pub(crate) unsafe fn system_call<F, R>(worker: *mut Worker, save: *mut ExecutionContext, f: F) -> R
where
    F: FnOnce(&mut Worker) -> R,
{
    if (*worker).in_system_call {
        fatal(Violation::NestedSystemCall {
            op: "run_on_system_stack",
        });
    }
    let mut call = SystemCall { f: Some(f), result: None };
    (*worker).pending = Some(PendingCall {
        data: ptr::addr_of_mut!(call).cast::<u8>(),
        run: system_shim::<F, R>,
    });
    (*worker).in_system_call = true;
    (*worker).system_return = save;
    (*save).resumable = true;
    let entry = ExecutionContext::entry((*worker).system_stack.top(), system_entry, worker as usize);
    arch::swap(save, &entry);
    (*save).resumable = false;
    match call.result.take() {
        Some(Ok(value)) => value,
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => fatal(Violation::NoPendingCall),
    }
}

unsafe fn system_shim<F, R>(data: *mut u8, worker: *mut Worker) -> !
where
    F: FnOnce(&mut Worker) -> R,
{
    let call = &mut *data.cast::<SystemCall<F, R>>();
    let f = match call.f.take() {
        Some(f) => f,
        None => fatal(Violation::NoPendingCall),
    };
    call.result = Some(panic::catch_unwind(AssertUnwindSafe(|| f(&mut *worker))));
    (*worker).in_system_call = false;
    let back = std::mem::replace(&mut (*worker).system_return, ptr::null_mut());
    arch::jump(back)
}

#[inline(never)]
fn log_enter(worker: usize) {
    tracing::info!(worker, "worker entering system stack");
}

#[inline(never)]
fn log_leave(worker: usize, stats: WorkerStats) {
    tracing::info!(
        worker,
        switches = stats.switches,
        system_calls = stats.system_calls,
        growths = stats.growths,
        "worker left system stack"
    );
}

#[inline(never)]
fn log_resume(worker: usize, task: u64) {
    tracing::trace!(worker, task, "resume");
}

#[inline(never)]
fn log_system_entry(worker: usize) {
    tracing::trace!(worker, "system stack entry");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::stack::MmapAllocator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker() -> Worker {
        let config = RuntimeConfig::default().with_seed(11);
        Worker::new(0, config, Arc::new(MmapAllocator::new())).unwrap()
    }

    #[test]
    fn host_call_runs_on_the_system_stack() {
        let mut w = worker();
        let (kind, id) = w.run_on_system_stack(|w| (w.stack_kind(arch::current_sp()), w.id()));
        assert_eq!(kind, StackKind::System);
        assert_eq!(id, 0);
        assert_eq!(w.stack_kind(arch::current_sp()), StackKind::Host);
        assert_eq!(w.stats().system_calls, 1);
    }

    #[test]
    fn nested_system_call_runs_in_place() {
        let mut w = worker();
        let depth = w.run_on_system_stack(|w| w.run_on_system_stack(|w| w.stats().system_calls));
        assert_eq!(depth, 1);
    }

    #[test]
    fn panic_on_system_stack_resumes_on_caller() {
        let mut w = worker();
        let err = panic::catch_unwind(AssertUnwindSafe(|| {
            w.run_on_system_stack(|_| -> u32 { panic!("system side") })
        }))
        .unwrap_err();
        assert_eq!(panic_message(&*err), "system side");
        // The worker is usable afterwards.
        assert_eq!(w.run_on_system_stack(|_| 5), 5);
    }

    static RAN: AtomicUsize = AtomicUsize::new(0);

    fn run_all(w: &mut Worker) -> ! {
        if let Some(handoff) = w.take_handoff() {
            match handoff {
                Handoff::Yield(task) | Handoff::Park(task) => w.resume(task),
                Handoff::Exit(task) => {
                    assert!(task.is_dead());
                    RAN.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let next = w.attachment::<std::cell::Cell<Option<usize>>>().and_then(|c| c.take());
        match next {
            Some(_) => {
                let task = w.spawn(|cx| {
                    let before = cx.fastrand();
                    cx.yield_now();
                    let after = cx.fastrand();
                    assert_ne!(before, after);
                })
                .unwrap();
                w.resume(task)
            }
            None => w.exit(),
        }
    }

    #[test]
    fn run_resume_yield_exit() {
        let mut w = worker();
        w.attach(std::cell::Cell::new(Some(1usize)));
        w.run(run_all);
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
        let stats = w.stats();
        assert_eq!(stats.switches, 2);
        // run, yield, exit.
        assert_eq!(stats.system_calls, 3);
        assert!(w.current_task().is_none());
    }

    #[test]
    fn seeded_workers_draw_the_same_sequence() {
        let mut a = worker();
        let mut b = worker();
        let xs: Vec<u32> = (0..8).map(|_| a.fastrand()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.fastrand()).collect();
        assert_eq!(xs, ys);
        b.set_seed(12);
        assert!(b.fastrandn(10) < 10);
    }

    #[test]
    fn construction_validates_the_config() {
        let config = RuntimeConfig::default().with_system_headroom(1 << 20);
        let err = Worker::new(0, config, Arc::new(MmapAllocator::new())).unwrap_err();
        assert!(matches!(err, SetupError::Config(ConfigError::TooSmall { .. })));
        assert!(err.to_string().starts_with("invalid runtime configuration"));
    }

    #[test]
    fn attachment_is_typed() {
        let mut w = worker();
        w.attach(41u32);
        assert_eq!(w.attachment::<u32>(), Some(&41));
        assert!(w.attachment::<u64>().is_none());
    }
}
