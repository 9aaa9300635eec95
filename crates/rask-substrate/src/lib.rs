// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Rask execution substrate.
//!
//! The layer beneath an M:N task scheduler:
//! - memory: pointer-free bulk copy, clear and compare
//! - context/arch: saved register state and the switch primitives
//! - worker/task: moving between task stacks and the system stack
//! - frames: growable frame stacks with pointer relocation
//! - call: dynamically sized calls with barriered result copy
//! - sync/rand: publication barrier and per-worker fastrand
//!
//! Scheduling policy, the collector and OS threads live above this crate.

mod arch;

pub mod call;
pub mod config;
pub mod context;
pub mod error;
pub mod frames;
pub mod memory;
pub mod rand;
pub mod stack;
pub mod sync;
pub mod task;
pub mod worker;

pub use call::{invoke, try_invoke, FrameFn, ResultCopy, TypeDescriptor, UnscannedResults, WriteBarrier};
pub use config::RuntimeConfig;
pub use context::{save_context, ExecutionContext};
pub use error::{ConfigError, SetupError, StackError, Violation};
pub use frames::{FrameLayout, FrameStack, GrowthReport, StackAddr};
pub use rand::FastRand;
pub use stack::{HeapAllocator, MmapAllocator, StackAllocator, StackRegion};
pub use sync::publication_barrier;
pub use task::{TaskCx, TaskId, TaskRef, TaskState};
pub use worker::{Handoff, ScheduleFn, StackKind, Worker, WorkerStats};
