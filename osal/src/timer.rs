//! The software timer wheel.
//!
//! A flat, unordered singly linked list of timers, walked once per tick.
//! Cancellation is two-phase: [`stop`] only clears a timer's event mask;
//! the walk in [`on_tick`] is what actually unlinks and frees it, the same
//! "cancel-then-reap" split the original core uses so that a timer can
//! never be freed while something else is mid-walk over the list.

use core::ptr::NonNull;

use crate::heap::Heap;
use crate::task::{self, TaskHandle, Tcb};

#[repr(C)]
pub(crate) struct TimerNode {
    next: Option<NonNull<TimerNode>>,
    task: Option<NonNull<Tcb>>,
    event_flag: u16,
    timeout: u16,
    reload: u16,
}

/// Find the timer matching `(task, event_flag)`, if any.
fn find(
    head: Option<NonNull<TimerNode>>,
    task: Option<TaskHandle>,
    event_flag: u16,
) -> Option<NonNull<TimerNode>> {
    let task_ptr = task.map(TaskHandle::as_ptr);
    let mut cur = head;
    while let Some(n) = cur {
        // Safety: every node reachable from `head` is a live `TimerNode`.
        let node = unsafe { n.as_ref() };
        if node.event_flag == event_flag && node.task.map(|p| p.as_ptr()) == task_ptr {
            return Some(n);
        }
        cur = node.next;
    }
    None
}

/// Start (or restart) a timer for `(task, event_flag)`.
///
/// If a timer already matches, its `timeout` is overwritten in place (this
/// is what makes repeated `start_timer` calls idempotent rather than
/// piling up duplicate timers). Otherwise a new timer is allocated and
/// appended to the list. `reload` is the timeout to restore after the
/// timer fires; pass `0` for a one-shot timer.
pub(crate) fn start<const BYTES: usize>(
    heap: &mut Heap<BYTES>,
    head: &mut Option<NonNull<TimerNode>>,
    count: &mut u8,
    task: Option<TaskHandle>,
    event_flag: u16,
    timeout: u16,
    reload: u16,
) -> bool {
    if let Some(mut existing) = find(*head, task, event_flag) {
        unsafe { existing.as_mut().timeout = timeout };
        return true;
    }

    let raw = match heap.alloc(core::mem::size_of::<TimerNode>()) {
        Some(p) => p,
        None => {
            log::debug!("start_timer refused: heap exhausted");
            return false;
        }
    };
    let mut node = raw.cast::<TimerNode>();
    // Safety: `raw` is freshly allocated and large enough for `TimerNode`.
    unsafe {
        node.as_ptr().write(TimerNode {
            next: None,
            task: task.map(|t| NonNull::new_unchecked(t.as_ptr())),
            event_flag,
            timeout,
            reload,
        });
    }

    match *head {
        None => *head = Some(node),
        Some(mut tail) => {
            loop {
                let next = unsafe { tail.as_ref().next };
                match next {
                    Some(n) => tail = n,
                    None => break,
                }
            }
            unsafe { tail.as_mut().next = Some(node) };
        }
    }
    *count += 1;
    true
}

/// Mark the timer matching `(task, event_flag)` for removal. The node is
/// actually unlinked and freed by the next [`on_tick`] call.
pub(crate) fn stop(head: Option<NonNull<TimerNode>>, task: Option<TaskHandle>, event_flag: u16) -> bool {
    match find(head, task, event_flag) {
        Some(mut n) => {
            unsafe { n.as_mut().event_flag = 0 };
            true
        }
        None => false,
    }
}

/// Current `timeout` of the timer matching `(task, event_flag)`, or `0` if
/// none matches.
pub(crate) fn get_timeout(head: Option<NonNull<TimerNode>>, task: Option<TaskHandle>, event_flag: u16) -> u16 {
    match find(head, task, event_flag) {
        Some(n) => unsafe { n.as_ref().timeout },
        None => 0,
    }
}

/// Advance every timer by `ms`, firing (setting the task's event bits) and
/// reloading or reaping each one as appropriate. Returns the updated head
/// of the list.
pub(crate) fn on_tick<const BYTES: usize>(
    heap: &mut Heap<BYTES>,
    mut head: Option<NonNull<TimerNode>>,
    count: &mut u8,
    ms: u16,
) -> Option<NonNull<TimerNode>> {
    let mut prev: Option<NonNull<TimerNode>> = None;
    let mut cur = head;

    while let Some(mut n) = cur {
        // Safety: every node reachable from the list is live.
        let node = unsafe { n.as_mut() };

        node.timeout = node.timeout.saturating_sub(ms);

        if node.timeout == 0 && node.event_flag != 0 {
            task::set_event(
                node.task.map(TaskHandle),
                node.event_flag,
            );
            node.timeout = node.reload;
        }

        let reap = node.timeout == 0 || node.event_flag == 0;
        let next = node.next;

        if reap {
            match prev {
                None => head = next,
                Some(mut p) => unsafe { p.as_mut().next = next },
            }
            *count -= 1;
            heap.free(n.cast::<u8>());
        } else {
            prev = Some(n);
        }
        cur = next;
    }

    head
}
