//! A minimal, cooperative operating-system abstraction layer.
//!
//! The core is a single-priority-queue scheduler: each task has a handler
//! function and a 16-bit event word, and the scheduler repeatedly runs the
//! handler of the highest-priority task with a non-zero event word. There
//! is no preemption and no blocking; a handler is expected to do its work
//! and return.
//!
//! Three subsystems sit underneath the scheduler:
//!
//! - [`heap`] — a two-region allocator (a bucket of fixed-size blocks for
//!   small, long-lived allocations, and a general-purpose wilderness region
//!   for everything else) that every other subsystem allocates from.
//! - [`timer`] — a software timer wheel driven by a periodic tick from the
//!   platform port.
//! - [`msg`] — per-task message queues built on top of the heap.
//!
//! None of this is portable by itself: a [`port::Port`] implementation
//! supplies interrupt masking and the tick source. See the `osal-port-std`
//! crate for a Linux simulation host port.
#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod heap;
mod msg;
mod port;
mod system;
mod task;
mod timer;

pub use error::{OsalResult, Status};
pub use heap::HeapLayout;
#[cfg(feature = "heap-metrics")]
pub use heap::HeapStats;
pub use msg::MsgBuf;
pub use port::Port;
pub use system::Os;
pub use task::{TaskHandle, TaskHandlerFn, TaskInitFn, SYS_EVENT_MSG};
