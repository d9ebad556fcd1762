//! Task control blocks and the priority-ordered task list.

use core::ptr::NonNull;

use crate::error::Status;
use crate::heap::Heap;
use crate::msg::MsgHeader;

/// Bit `0x8000` is reserved: it signals "at least one message is waiting"
/// and is maintained by [`crate::msg`], not by application code.
pub const SYS_EVENT_MSG: u16 = 0x8000;

/// One-shot task initializer, called once by [`crate::Os::run`] (or
/// [`crate::Os::run_init`] directly) before the main loop starts.
pub type TaskInitFn = fn(TaskHandle);
/// Recurring event handler. Returns the subset of `events` that should be
/// re-raised (OR-merged back into the task's event word) once the handler
/// returns.
pub type TaskHandlerFn = fn(TaskHandle, u16) -> u16;

/// Task control block. Allocated once from the [`Heap`] by [`add_task`] and
/// never freed or moved for the lifetime of the system.
#[repr(C)]
pub(crate) struct Tcb {
    pub(crate) next: Option<NonNull<Tcb>>,
    pub(crate) priority: u8,
    pub(crate) events: u16,
    pub(crate) init: TaskInitFn,
    pub(crate) handler: TaskHandlerFn,
    pub(crate) messages: Option<NonNull<MsgHeader>>,
}

/// A stable reference to a registered task.
///
/// Mirrors a `struct osal_tcb *` in the original core: cheap to copy, valid
/// for as long as the owning [`crate::Os`] exists (which, per its own
/// pinning requirement, is for the lifetime of the program).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskHandle(pub(crate) NonNull<Tcb>);

impl TaskHandle {
    #[inline]
    pub(crate) fn as_ptr(self) -> *mut Tcb {
        self.0.as_ptr()
    }
}

/// Insert `task` into the list headed by `head` so the list remains sorted
/// by strictly decreasing priority, with ties broken FIFO (a new task is
/// placed after existing tasks of the same priority).
pub(crate) fn insert_sorted(head: &mut Option<NonNull<Tcb>>, mut task: NonNull<Tcb>) {
    // Safety: `task` was just allocated and initialized by the caller and is
    // not yet reachable from `head`, so we have exclusive access.
    let task_priority = unsafe { task.as_ref().priority };

    let mut slot = head;
    loop {
        match *slot {
            None => {
                unsafe { task.as_mut().next = None };
                *slot = Some(task);
                return;
            }
            Some(mut cur) => {
                // Safety: `cur` is a live TCB owned by this list.
                let cur_priority = unsafe { cur.as_ref().priority };
                if task_priority > cur_priority {
                    unsafe { task.as_mut().next = Some(cur) };
                    *slot = Some(task);
                    return;
                }
                slot = unsafe { &mut cur.as_mut().next };
            }
        }
    }
}

/// Allocate and link a new task.
///
/// Returns [`Status::InvalidTaskId`] if `task_count` has already reached
/// `max_tasks`, or if the heap cannot supply a TCB-sized block -- the
/// original core returns a null task pointer for both conditions alike, so
/// this does not distinguish them under a more specific status either.
pub(crate) fn add_task<const BYTES: usize>(
    heap: &mut Heap<BYTES>,
    head: &mut Option<NonNull<Tcb>>,
    task_count: &mut u8,
    max_tasks: u8,
    init: TaskInitFn,
    handler: TaskHandlerFn,
    priority: u8,
) -> Result<TaskHandle, Status> {
    if *task_count >= max_tasks {
        log::debug!("add_task refused: task table full at {max_tasks} tasks");
        return Err(Status::InvalidTaskId);
    }
    let raw = heap
        .alloc(core::mem::size_of::<Tcb>())
        .ok_or(Status::InvalidTaskId)?;
    let mut tcb = raw.cast::<Tcb>();
    // Safety: `raw` is freshly allocated, properly sized and aligned
    // (the heap aligns to `align_of::<u32>()`, and `Tcb`'s largest field is
    // a pointer/fn-pointer -- the host target's pointer alignment is a
    // multiple of 4).
    unsafe {
        tcb.as_ptr().write(Tcb {
            next: None,
            priority,
            events: 0,
            init,
            handler,
            messages: None,
        });
    }
    insert_sorted(head, tcb);
    *task_count += 1;
    log::debug!("add_task: priority {priority}, {task_count} tasks registered");
    Ok(TaskHandle(tcb))
}

/// Bitwise-OR `bits` into `task`'s event word. A no-op if `task` is `None`,
/// matching the legacy C behavior of tolerating a null task pointer.
pub(crate) fn set_event(task: Option<TaskHandle>, bits: u16) {
    if let Some(t) = task {
        // Safety: the caller holds the system's critical section.
        unsafe { (*t.as_ptr()).events |= bits };
    }
}

pub(crate) fn clear_event(task: Option<TaskHandle>, bits: u16) {
    if let Some(t) = task {
        unsafe { (*t.as_ptr()).events &= !bits };
    }
}

pub(crate) fn get_event(task: Option<TaskHandle>) -> u16 {
    match task {
        Some(t) => unsafe { (*t.as_ptr()).events },
        None => 0,
    }
}

/// Return the highest-priority task (the list is kept sorted) whose event
/// word is non-zero.
pub(crate) fn next_ready(head: Option<NonNull<Tcb>>) -> Option<TaskHandle> {
    let mut cur = head;
    while let Some(t) = cur {
        // Safety: every node reachable from `head` is a live TCB.
        let tcb = unsafe { t.as_ref() };
        if tcb.events != 0 {
            return Some(TaskHandle(t));
        }
        cur = tcb.next;
    }
    None
}

/// Invoke every task's `init` callback once, in list order (descending
/// priority).
pub(crate) fn run_init(head: Option<NonNull<Tcb>>) {
    let mut cur = head;
    while let Some(t) = cur {
        let tcb = unsafe { t.as_ref() };
        (tcb.init)(TaskHandle(t));
        cur = tcb.next;
    }
}
