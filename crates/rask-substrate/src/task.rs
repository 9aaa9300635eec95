// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks and the task-side switch interface.
//!
//! A task owns a fixed native stack (its Rust code runs there) and a
//! growable frame stack. It is owned through exactly one [`TaskRef`]: held
//! by the worker while the task runs, and by whoever the task was handed to
//! while it is suspended. Code running inside a task reaches the runtime
//! through [`TaskCx`].

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::arch;
use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::error::{fatal, SetupError, Violation};
use crate::frames::{FrameLayout, FrameStack, GrowthReport, StackAddr, MAX_LOCALS};
use crate::stack::{OwnedStack, StackAllocator};
use crate::worker::{self, Handoff, StackKind, Worker};

pub type TaskId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never run.
    Runnable,
    /// Executing on some worker.
    Running,
    /// Context saved; waiting to be resumed.
    Suspended,
    /// Entry returned or panicked.
    Dead,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Runnable => "runnable",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Dead => "dead",
        }
    }
}

type TaskEntry = Box<dyn FnOnce(&mut TaskCx) + Send>;

pub struct Task {
    id: TaskId,
    pub(crate) native: OwnedStack,
    pub(crate) frames: FrameStack,
    pub(crate) context: ExecutionContext,
    pub(crate) state: TaskState,
    /// Worker the task is running on, or last ran on.
    pub(crate) worker: *mut Worker,
    pub(crate) last_worker: Option<usize>,
    entry: Option<TaskEntry>,
    scratch: [usize; 4],
    panic: Option<String>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state == TaskState::Dead
    }

    /// Id of the worker that last ran this task.
    pub fn last_worker(&self) -> Option<usize> {
        self.last_worker
    }

    /// Message of the panic that ended the task, if any.
    pub fn panic_message(&self) -> Option<&str> {
        self.panic.as_deref()
    }

    /// Pointer-free words for the scheduler's own bookkeeping.
    pub fn scratch(&self) -> &[usize; 4] {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut [usize; 4] {
        &mut self.scratch
    }

    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("last_worker", &self.last_worker)
            .field("frames", &self.frames)
            .finish()
    }
}

/// Unique owning handle to a task.
pub struct TaskRef(NonNull<Task>);

// SAFETY: a TaskRef outside a worker's current slot refers to a task that is
// not running, so nothing else touches it; the entry closure is `Send`.
unsafe impl Send for TaskRef {}

impl TaskRef {
    /// Allocate a task that will run `entry` the first time it is resumed.
    pub fn spawn<F>(
        config: &RuntimeConfig,
        allocator: Arc<dyn StackAllocator>,
        entry: F,
    ) -> Result<TaskRef, SetupError>
    where
        F: FnOnce(&mut TaskCx) + Send + 'static,
    {
        config.validate()?;
        let native = OwnedStack::new(allocator.clone(), config.task_stack_size)?;
        let frames = FrameStack::new(
            allocator,
            config.frame_stack_min,
            config.frame_stack_max,
            config.stack_guard,
        )?;
        let task = Box::new(Task {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            native,
            frames,
            context: ExecutionContext::default(),
            state: TaskState::Runnable,
            worker: ptr::null_mut(),
            last_worker: None,
            entry: Some(Box::new(entry)),
            scratch: [0; 4],
            panic: None,
        });
        let task = NonNull::from(Box::leak(task));
        let raw = task.as_ptr();
        // SAFETY: the native stack belongs to this task alone and lives as
        // long as the task; the entry receives the task's own address.
        unsafe {
            (*raw).context = ExecutionContext::entry((*raw).native.top(), task_entry, raw as usize);
        }
        Ok(TaskRef(task))
    }

    pub(crate) fn as_ptr(&self) -> *mut Task {
        self.0.as_ptr()
    }
}

impl Deref for TaskRef {
    type Target = Task;

    fn deref(&self) -> &Task {
        // SAFETY: the handle is the unique owner of a live task.
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for TaskRef {
    fn deref_mut(&mut self) -> &mut Task {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        unsafe { self.0.as_mut() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        // SAFETY: the handle owns the allocation made in `spawn`.
        let task = unsafe { Box::from_raw(self.0.as_ptr()) };
        if matches!(task.state, TaskState::Suspended | TaskState::Running) {
            // Values still live on its native stack are leaked, never dropped.
            tracing::warn!(task = task.id, state = task.state.name(), "dropping a task that has not finished");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// First frame of every task: run the entry, then hand the dead task back to
/// the scheduler.
extern "C" fn task_entry(arg: usize) -> ! {
    let raw = arg as *mut Task;
    // SAFETY: `spawn` passes the task's own address, and a running task is
    // touched only by the worker running it.
    let (task, entry) = unsafe { (NonNull::new_unchecked(raw), (*raw).entry.take()) };
    let mut cx = TaskCx { task };
    if let Some(entry) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry(&mut cx))) {
            let message = panic_message(&*payload);
            drop(payload);
            // SAFETY: as above.
            unsafe { (*raw).panic = Some(message) };
        }
    }
    cx.finish()
}

/// Handle for code running inside a task.
pub struct TaskCx {
    task: NonNull<Task>,
}

impl TaskCx {
    fn task(&self) -> &Task {
        // SAFETY: the task is running, so it is alive and only this
        // context's thread of control reaches it.
        unsafe { self.task.as_ref() }
    }

    fn task_mut(&mut self) -> &mut Task {
        // SAFETY: as in `task`, and `&mut self` makes the access exclusive.
        unsafe { self.task.as_mut() }
    }

    fn worker(&self) -> *mut Worker {
        self.task().worker
    }

    pub fn id(&self) -> TaskId {
        self.task().id
    }

    /// Id of the worker currently running this task. May change after any
    /// suspension.
    pub fn worker_id(&self) -> usize {
        // SAFETY: a running task's worker outlives the run.
        unsafe { (*self.worker()).id() }
    }

    /// Suspend this task and call `f` on a fresh frame at the top of the
    /// worker's system stack, handing it the suspended task. `f` never
    /// returns (`Infallible` has no values; end it with `reschedule`,
    /// `resume` or `exit`); this call returns when the task is resumed,
    /// possibly on a different worker.
    ///
    /// Calling it anywhere but on this task's own stack is fatal.
    pub fn switch_to_system_and_call<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Worker, TaskRef) -> Infallible,
    {
        let raw = self.task.as_ptr();
        // SAFETY: `raw` is the running task; `enter_from_task` checks the
        // stack before switching.
        unsafe { worker::enter_from_task(raw, f) }
    }

    /// Run `f` on the worker's system stack and return its result. Called
    /// from the system or fault stack it runs `f` in place. A panic in `f`
    /// resumes unwinding here, on the task stack.
    pub fn run_on_system_stack<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Worker) -> R,
    {
        let raw = self.task.as_ptr();
        let worker = self.worker();
        // SAFETY: the running task and its worker are both live; the task
        // path saves into the task's own context.
        unsafe {
            match (*worker).stack_kind(arch::current_sp()) {
                StackKind::System | StackKind::Fault => f(&mut *worker),
                StackKind::Task => worker::system_call(worker, ptr::addr_of_mut!((*raw).context), f),
                found => fatal(Violation::WrongStack {
                    op: "run_on_system_stack",
                    found,
                }),
            }
        }
    }

    /// Give up the worker; the scheduler gets `Handoff::Yield`.
    pub fn yield_now(&mut self) {
        self.switch_to_system_and_call(|worker, task| {
            worker.post(Handoff::Yield(task));
            worker.reschedule()
        })
    }

    /// Suspend until someone resumes the task; the scheduler gets
    /// `Handoff::Park`.
    pub fn park(&mut self) {
        self.switch_to_system_and_call(|worker, task| {
            worker.post(Handoff::Park(task));
            worker.reschedule()
        })
    }

    fn finish(&mut self) -> ! {
        self.switch_to_system_and_call(|worker, mut task| {
            task.state = TaskState::Dead;
            worker.post(Handoff::Exit(task));
            worker.reschedule()
        });
        fatal(Violation::NotResumable {
            task: self.id(),
            state: TaskState::Dead.name(),
        })
    }

    pub fn frames(&self) -> &FrameStack {
        &self.task().frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameStack {
        &mut self.task_mut().frames
    }

    /// Make sure `extra` bytes fit above the frame stack's guard, growing it
    /// on the system stack if not.
    pub fn ensure_stack_space(&mut self, extra: usize) {
        self.make_room(extra);
    }

    fn make_room(&mut self, extra: usize) -> Option<GrowthReport> {
        if self.frames().has_room(extra) {
            return None;
        }
        let raw = self.task.as_ptr();
        Some(self.run_on_system_stack(move |worker| {
            // SAFETY: the task is suspended in `system_call` for the
            // duration; nothing else touches its frames.
            worker.grow_frames(unsafe { &mut (*raw).frames }, extra)
        }))
    }

    /// Call entry: push a frame, growing the stack first when it would
    /// cross the guard. An `argp` into the caller's frames follows the
    /// frames if they move.
    pub fn push_frame(&mut self, layout: FrameLayout, argp: StackAddr) {
        if layout.words > MAX_LOCALS {
            fatal(Violation::FrameTooWide {
                words: layout.words,
            });
        }
        let argp = match self.make_room(layout.bytes()) {
            Some(growth) => growth.relocate(argp),
            None => argp,
        };
        if let Err(v) = self.frames_mut().push(layout, argp) {
            fatal(v);
        }
    }

    pub fn pop_frame(&mut self) {
        if let Err(v) = self.frames_mut().pop() {
            fatal(v);
        }
    }

    pub fn fastrand(&mut self) -> u32 {
        // SAFETY: a running task's worker outlives the run.
        unsafe { (*self.worker()).fastrand() }
    }

    pub fn fastrandn(&mut self, n: u32) -> u32 {
        // SAFETY: as above.
        unsafe { (*self.worker()).fastrandn(n) }
    }

    pub fn scratch(&mut self) -> &mut [usize; 4] {
        self.task_mut().scratch_mut()
    }
}
