//! Status codes returned by value from the public API.
//!
//! The core never aborts in response to a caller error; every fallible
//! operation returns one of these codes instead. Only an invariant
//! violation inside the allocator (freeing a pointer outside the heap, or
//! double-freeing a block) is escalated to a panic.

use core::fmt;

/// Result of a fallible core operation.
///
/// `Ok` carries nothing interesting by itself ([`Status::Ok`] is the success
/// case); the type exists so callers can use `?` the way they would with any
/// other `Result`.
pub type OsalResult<T = ()> = Result<T, Status>;

/// Status codes mirrored from the original C `OSAL_xxx` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// Success.
    Ok,
    /// The target task was null or otherwise unknown.
    InvalidTask,
    /// A message pointer was null.
    InvalidMsgPointer,
    /// A timer matching `(task, event)` was not found.
    InvalidEventId,
    /// The heap could not supply memory for a new timer.
    NoTimerAvail,
    /// A message is still linked into a queue and cannot be freed.
    MsgBufferNotAvail,
    /// The task table is full (the `max_tasks` bound given to `Os::new`).
    InvalidTaskId,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::InvalidTask => "invalid task",
            Status::InvalidMsgPointer => "invalid message pointer",
            Status::InvalidEventId => "invalid event id",
            Status::NoTimerAvail => "no timer available",
            Status::MsgBufferNotAvail => "message buffer not available",
            Status::InvalidTaskId => "invalid task id",
        };
        f.write_str(s)
    }
}
