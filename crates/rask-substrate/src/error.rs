// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types and the fatal-violation path.
//!
//! Two classes of failure exist at this layer:
//! - recoverable construction errors (`StackError`, `ConfigError`), returned
//!   as `Result` from allocators, constructors and config parsing;
//! - contract violations (`Violation`), which abort the process through
//!   [`fatal`]. The runtime above trusts this core completely, so a
//!   violation is a bug in a caller and is never retried.

use thiserror::Error;

use crate::worker::StackKind;

/// Stack allocation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("stack size must be non-zero")]
    ZeroSize,

    #[error("stack size {size} is not a multiple of the page size ({page})")]
    Unaligned { size: usize, page: usize },

    #[error("failed to allocate a {size}-byte stack: {reason}")]
    AllocFailed { size: usize, reason: String },

    #[error("failed to protect guard page of a {size}-byte stack: {reason}")]
    GuardFailed { size: usize, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },

    #[error("{field} is too small: {value} < {min}")]
    TooSmall {
        field: &'static str,
        value: usize,
        min: usize,
    },

    #[error("frame_stack_max ({max}) is below frame_stack_min ({min})")]
    MaxBelowMin { min: usize, max: usize },

    #[error("stack_guard ({guard}) leaves no room in a {size}-byte frame stack")]
    GuardTooLarge { guard: usize, size: usize },
}

/// Why a worker or task could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stack(#[from] StackError),
}

/// A broken contract between this core and its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("{op} called from unexpected stack ({found:?})")]
    WrongStack { op: &'static str, found: StackKind },

    #[error("{op} called while a system-stack call is in flight")]
    NestedSystemCall { op: &'static str },

    #[error("resume: worker {worker} is already running task {running}")]
    WorkerBusy { worker: usize, running: u64 },

    #[error("resume: task {task} is not resumable (state {state})")]
    NotResumable { task: u64, state: &'static str },

    #[error("worker {worker} has no schedule entry point")]
    NoScheduler { worker: usize },

    #[error("worker {worker} re-entered while already running")]
    WorkerReentered { worker: usize },

    #[error("handoff posted while a previous one is still pending")]
    HandoffPending,

    #[error("system-stack entry without a pending call")]
    NoPendingCall,

    #[error("switch target panicked on the system stack: {message}")]
    SystemPanic { message: String },

    #[error("stack overflow: frame stack needs {requested} bytes, limit is {max}")]
    StackOverflow { requested: usize, max: usize },

    #[error("stack growth out of memory: {0}")]
    OutOfMemory(StackError),

    #[error("system stack exhausted: {remaining} bytes left, {headroom} required")]
    SystemStackExhausted { remaining: usize, headroom: usize },

    #[error("frame does not fit above the stack guard ({needed} bytes needed)")]
    GuardBreached { needed: usize },

    #[error("frame of {words} words exceeds the 64-word pointer map")]
    FrameTooWide { words: usize },

    #[error("pop on an empty frame stack")]
    EmptyFrameStack,

    #[error("local slot {slot} out of range for a {words}-word frame")]
    SlotOutOfRange { slot: usize, words: usize },

    #[error("stack address {addr:#x} escaped the live frame stack")]
    EscapedStackPointer { addr: usize },

    #[error("call frame of {size} bytes exceeds the {max}-byte ceiling")]
    FrameTooLarge { size: usize, max: usize },

    #[error("result offset {offset} beyond a {size}-byte argument frame")]
    ResultOffset { offset: usize, size: usize },

    #[error("result range [{offset}, {end}) splits pointer word {word}")]
    ResultSplitsPointer { word: usize, offset: usize, end: usize },

    #[error("register primitive self-check failed: {0}")]
    ArchCheck(&'static str),
}

/// Report a violation and abort. Never returns, never unwinds.
#[cold]
#[inline(never)]
pub fn fatal(violation: Violation) -> ! {
    tracing::error!(%violation, "fatal runtime error");
    eprintln!("fatal error: {violation}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_messages_name_the_operation() {
        let v = Violation::WrongStack {
            op: "switch_to_system_and_call",
            found: StackKind::System,
        };
        assert_eq!(
            v.to_string(),
            "switch_to_system_and_call called from unexpected stack (System)"
        );
    }

    #[test]
    fn out_of_memory_wraps_stack_error() {
        let v = Violation::OutOfMemory(StackError::AllocFailed {
            size: 4096,
            reason: "ENOMEM".into(),
        });
        assert!(v.to_string().contains("4096-byte stack"));
    }
}
