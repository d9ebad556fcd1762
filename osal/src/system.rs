//! The scheduler: glues the heap, task table, and timer wheel behind one
//! critical section and drives the non-preemptive main loop.

use core::ptr::NonNull;

use crate::error::{OsalResult, Status};
use crate::heap::{Heap, HeapLayout};
use crate::msg::{self, MsgBuf};
use crate::port::{CriticalCell, Port};
use crate::task::{self, TaskHandle, TaskHandlerFn, TaskInitFn, Tcb};
use crate::timer::{self, TimerNode};

/// All mutable kernel state, reached only from inside [`CriticalCell::with`].
///
/// The original core disables interrupts around each individual list/heap
/// operation rather than locking per-field; bundling everything behind one
/// cell reproduces that coarse-grained locking instead of inventing
/// fine-grained locks the hardware port never had.
struct Inner<const BYTES: usize> {
    heap: Heap<BYTES>,
    tasks: Option<NonNull<Tcb>>,
    task_count: u8,
    max_tasks: u8,
    timers: Option<NonNull<TimerNode>>,
    timer_count: u8,
    current_time: u32,
}

/// The scheduler itself.
///
/// `BYTES` is the total heap arena size; `P` selects the platform port. An
/// `Os` must live in a `static` (or otherwise never move after the first
/// call to [`Os::init`]): every task, message, and timer handle it hands
/// out is a raw pointer into its own heap arena, and moving the struct
/// would invalidate all of them. See [`Heap`]'s own safety note for the
/// same requirement one level down.
pub struct Os<P: Port, const BYTES: usize> {
    inner: CriticalCell<Inner<BYTES>>,
    _port: core::marker::PhantomData<P>,
}

// Safety: `inner` is the only field and is already `Sync` by construction.
unsafe impl<P: Port, const BYTES: usize> Sync for Os<P, BYTES> {}

impl<P: Port, const BYTES: usize> Os<P, BYTES> {
    /// Construct a system with a default heap layout and room for
    /// `max_tasks` tasks. Must still be followed by a call to [`Os::init`]
    /// before use.
    pub const fn new(max_tasks: u8) -> Self {
        Self::with_layout(max_tasks, HeapLayout::default_const())
    }

    /// As [`Os::new`], with an explicit heap region layout.
    pub const fn with_layout(max_tasks: u8, layout: HeapLayout) -> Self {
        Self {
            inner: CriticalCell::new(Inner {
                heap: Heap::new(layout),
                tasks: None,
                task_count: 0,
                max_tasks,
                timers: None,
                timer_count: 0,
                current_time: 0,
            }),
            _port: core::marker::PhantomData,
        }
    }

    /// Initialize the heap and the platform tick source. Call once, before
    /// interrupts are enabled and before any task is added.
    pub fn init(&self) {
        self.inner.with::<P, _>(|st| st.heap.init());
        P::tick_init();
    }

    /// Register a task. Returns [`Status::InvalidTaskId`] once `max_tasks`
    /// registrations have already succeeded, or if the heap cannot supply a
    /// TCB-sized block.
    pub fn add_task(&self, init: TaskInitFn, handler: TaskHandlerFn, priority: u8) -> OsalResult<TaskHandle> {
        self.inner.with::<P, _>(|st| {
            task::add_task(
                &mut st.heap,
                &mut st.tasks,
                &mut st.task_count,
                st.max_tasks,
                init,
                handler,
                priority,
            )
        })
    }

    /// Release the small-block bucket's remaining free space to the
    /// wilderness allocator. Call once, after every startup task has been
    /// added and before [`Os::run`].
    pub fn mem_kick(&self) {
        self.inner.with::<P, _>(|st| st.heap.kick());
    }

    /// Set bits in `task`'s event word. A no-op (legacy behavior) if `task`
    /// is `None`. Two incompatible signatures for this operation exist
    /// across versions of the original core (one returns a status, one
    /// returns nothing); this follows the status-returning one.
    pub fn set_event(&self, task: Option<TaskHandle>, bits: u16) -> Status {
        self.inner.with::<P, _>(|_| task::set_event(task, bits));
        Status::Ok
    }

    pub fn clear_event(&self, task: Option<TaskHandle>, bits: u16) {
        self.inner.with::<P, _>(|_| task::clear_event(task, bits));
    }

    pub fn get_event(&self, task: Option<TaskHandle>) -> u16 {
        self.inner.with::<P, _>(|_| task::get_event(task))
    }

    /// Allocate a message buffer. Returns `None` if the heap is exhausted.
    pub fn msg_allocate(&self, len: u16) -> Option<MsgBuf> {
        self.inner.with::<P, _>(|st| msg::allocate(&mut st.heap, len))
    }

    /// Hand a message buffer back to the heap. See [`msg::deallocate`] for
    /// the "still queued" refusal rule.
    pub fn msg_deallocate(&self, buf: MsgBuf) -> Status {
        self.inner.with::<P, _>(|st| msg::deallocate(&mut st.heap, buf))
    }

    /// Append `msg` to `task`'s queue and raise its pending-message event.
    /// If `task` is `None`, `msg` is freed on the caller's behalf and
    /// [`Status::InvalidTask`] is returned.
    pub fn msg_send(&self, task: Option<TaskHandle>, msg: MsgBuf) -> Status {
        self.inner.with::<P, _>(|st| match task {
            None => {
                msg::deallocate(&mut st.heap, msg);
                Status::InvalidTask
            }
            Some(t) => {
                // Safety: `t` is a live handle owned by this system, and we
                // hold the critical section for the duration of the
                // mutation.
                let tcb = unsafe { &mut *t.as_ptr() };
                msg::send(tcb, msg);
                Status::Ok
            }
        })
    }

    /// Pop the oldest queued message for `task`, if any.
    pub fn msg_receive(&self, task: TaskHandle) -> Option<MsgBuf> {
        self.inner.with::<P, _>(|_| {
            let tcb = unsafe { &mut *task.as_ptr() };
            msg::receive(tcb)
        })
    }

    /// Start (or restart) a timer for `(task, event)`. `reload == 0` means
    /// one-shot; any other value reloads the timer to that many
    /// milliseconds each time it fires.
    pub fn start_timer(&self, task: TaskHandle, event: u16, timeout: u16, reload: u16) -> Status {
        let ok = self.inner.with::<P, _>(|st| {
            timer::start(
                &mut st.heap,
                &mut st.timers,
                &mut st.timer_count,
                Some(task),
                event,
                timeout,
                reload,
            )
        });
        if ok {
            Status::Ok
        } else {
            Status::NoTimerAvail
        }
    }

    pub fn stop_timer(&self, task: TaskHandle, event: u16) -> Status {
        let found = self.inner.with::<P, _>(|st| timer::stop(st.timers, Some(task), event));
        if found {
            Status::Ok
        } else {
            Status::InvalidEventId
        }
    }

    pub fn timer_get_timeout(&self, task: TaskHandle, event: u16) -> u16 {
        self.inner.with::<P, _>(|st| timer::get_timeout(st.timers, Some(task), event))
    }

    pub fn timer_num_active(&self) -> u8 {
        self.inner.with::<P, _>(|st| st.timer_count)
    }

    /// Milliseconds of simulated uptime.
    pub fn millis(&self) -> u32 {
        self.inner.with::<P, _>(|st| st.current_time)
    }

    /// Snapshot of heap block/byte high-water marks, mirroring the original
    /// core's `OSALMEM_METRICS` accessors. Requires the `heap-metrics`
    /// feature.
    #[cfg(feature = "heap-metrics")]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.inner.with::<P, _>(|st| st.heap.stats())
    }

    /// Advance the timer wheel by `ms`. The platform port calls this from
    /// its tick source; application code never calls it directly.
    pub fn on_tick(&self, ms: u16) {
        self.inner.with::<P, _>(|st| {
            st.current_time = st.current_time.wrapping_add(ms as u32);
            st.timers = timer::on_tick(&mut st.heap, st.timers, &mut st.timer_count, ms);
        });
    }

    /// Run every task's `init` callback once, in descending-priority order.
    pub fn run_init(&self) {
        self.inner.with::<P, _>(|st| task::run_init(st.tasks));
    }

    /// Run one iteration of the scheduler: find the highest-priority task
    /// with a non-zero event word, snapshot and clear its events, invoke
    /// its handler, and OR whatever it returns back into its event word.
    ///
    /// Returns `false` if no task was ready, so callers that want to idle
    /// the CPU between ticks know when to do so.
    pub fn poll(&self) -> bool {
        let work = self.inner.with::<P, _>(|st| {
            let ready = task::next_ready(st.tasks)?;
            let events = task::get_event(Some(ready));
            task::clear_event(Some(ready), events);
            Some((ready, events))
        });

        match work {
            Some((task, events)) if events != 0 => {
                log::trace!("scheduler dispatching task {:p} with events {events:#06x}", task.as_ptr());
                // Safety: `task` is a live handle; `handler` is a plain fn
                // pointer set once at `add_task` time.
                let handler = unsafe { (*task.as_ptr()).handler };
                let requeue = handler(task, events);
                if requeue != 0 {
                    self.inner.with::<P, _>(|_| task::set_event(Some(task), requeue));
                }
                true
            }
            _ => false,
        }
    }

    /// Run every task's `init` callback once, then run [`Os::poll`] forever.
    /// Does not return.
    pub fn run(&self) -> ! {
        self.run_init();
        loop {
            self.poll();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SYS_EVENT_MSG;
    use std::cell::{Cell, RefCell};

    thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(true) };
        static ORDER: RefCell<Vec<&'static str>> = RefCell::new(Vec::new());
    }

    /// A single-threaded critical section: each test runs on its own thread,
    /// so a plain save/restore of a thread-local flag is enough to exercise
    /// the `Port` contract without `osal-port-std`'s cross-thread locking.
    struct TestPort;

    impl Port for TestPort {
        type CriticalState = bool;

        fn enable_interrupts() {
            ENABLED.with(|e| e.set(true));
        }
        fn disable_interrupts() {
            ENABLED.with(|e| e.set(false));
        }
        fn interrupts_enabled() -> bool {
            ENABLED.with(Cell::get)
        }
        fn enter_critical() -> bool {
            let prev = ENABLED.with(Cell::get);
            ENABLED.with(|e| e.set(false));
            prev
        }
        fn exit_critical(prev: bool) {
            ENABLED.with(|e| e.set(prev));
        }
        fn tick_init() {}
        fn tick_start() {}
        fn tick_stop() {}
    }

    const BYTES: usize = 2048;

    fn noop_init(_: TaskHandle) {}
    fn noop_handler(_: TaskHandle, ev: u16) -> u16 {
        ev
    }

    fn task_a_handler(_: TaskHandle, _ev: u16) -> u16 {
        ORDER.with(|o| o.borrow_mut().push("A"));
        0
    }
    fn task_b_handler(_: TaskHandle, _ev: u16) -> u16 {
        ORDER.with(|o| o.borrow_mut().push("B"));
        0
    }

    fn fresh() -> Os<TestPort, BYTES> {
        let sys = Os::<TestPort, BYTES>::new(4);
        sys.init();
        sys
    }

    /// Scenario 1: two tasks, B at higher priority than A. A single `poll`
    /// pass must run the highest-priority ready task first.
    #[test]
    fn two_task_priority_runs_highest_first_each_poll() {
        ORDER.with(|o| o.borrow_mut().clear());
        let sys = fresh();
        let a = sys.add_task(noop_init, task_a_handler, 1).unwrap();
        let b = sys.add_task(noop_init, task_b_handler, 2).unwrap();
        sys.mem_kick();
        sys.run_init();

        sys.set_event(Some(a), 0x0001);
        sys.set_event(Some(b), 0x0002);

        assert!(sys.poll());
        assert!(sys.poll());
        assert!(!sys.poll());

        ORDER.with(|o| assert_eq!(*o.borrow(), vec!["B", "A"]));
    }

    /// Scenario 2: messages are delivered FIFO, and `SYS_EVENT_MSG` clears
    /// only once the queue is drained.
    #[test]
    fn message_fifo_and_pending_event_clears_after_last() {
        let sys = fresh();
        let t = sys.add_task(noop_init, noop_handler, 1).unwrap();
        sys.mem_kick();

        let mut m1 = sys.msg_allocate(1).unwrap();
        m1.copy_from_slice(&[1]);
        let mut m2 = sys.msg_allocate(1).unwrap();
        m2.copy_from_slice(&[2]);
        let mut m3 = sys.msg_allocate(1).unwrap();
        m3.copy_from_slice(&[3]);

        assert_eq!(sys.msg_send(Some(t), m1), Status::Ok);
        assert_eq!(sys.msg_send(Some(t), m2), Status::Ok);
        assert_eq!(sys.msg_send(Some(t), m3), Status::Ok);

        let r1 = sys.msg_receive(t).unwrap();
        assert_eq!(r1.as_slice(), &[1]);
        assert_eq!(sys.get_event(Some(t)) & SYS_EVENT_MSG, SYS_EVENT_MSG);
        sys.msg_deallocate(r1);

        let r2 = sys.msg_receive(t).unwrap();
        assert_eq!(r2.as_slice(), &[2]);
        sys.msg_deallocate(r2);

        let r3 = sys.msg_receive(t).unwrap();
        assert_eq!(r3.as_slice(), &[3]);
        assert_eq!(sys.get_event(Some(t)) & SYS_EVENT_MSG, 0);
        sys.msg_deallocate(r3);
    }

    /// A message sent to an absent task is freed on the sender's behalf.
    #[test]
    fn sending_to_a_null_task_frees_the_message_and_reports_invalid_task() {
        let sys = fresh();
        sys.mem_kick();
        let msg = sys.msg_allocate(4).unwrap();
        assert_eq!(sys.msg_send(None, msg), Status::InvalidTask);
    }

    /// Scenario 3: a periodic timer fires every `reload` ticks and restores
    /// its timeout each time.
    #[test]
    fn periodic_timer_fires_every_reload_and_restores_timeout() {
        let sys = fresh();
        let t = sys.add_task(noop_init, noop_handler, 1).unwrap();
        sys.mem_kick();

        sys.start_timer(t, 0x0010, 30, 30);

        sys.on_tick(10);
        sys.on_tick(10);
        assert_eq!(sys.get_event(Some(t)) & 0x0010, 0, "must not fire early");
        sys.on_tick(10);
        assert_eq!(sys.get_event(Some(t)) & 0x0010, 0x0010);
        assert_eq!(sys.timer_get_timeout(t, 0x0010), 30);

        sys.clear_event(Some(t), 0x0010);
        sys.on_tick(10);
        sys.on_tick(10);
        sys.on_tick(10);
        assert_eq!(sys.get_event(Some(t)) & 0x0010, 0x0010, "must fire a second time");
    }

    /// Scenario 4: stopping a one-shot timer before it ticks must prevent it
    /// from ever firing, and the node must be reaped on the next tick.
    #[test]
    fn stop_before_tick_prevents_firing_and_frees_timer() {
        let sys = fresh();
        let t = sys.add_task(noop_init, noop_handler, 1).unwrap();
        sys.mem_kick();

        assert_eq!(sys.start_timer(t, 0x0020, 20, 0), Status::Ok);
        assert_eq!(sys.timer_num_active(), 1);
        assert_eq!(sys.stop_timer(t, 0x0020), Status::Ok);
        assert_eq!(sys.timer_num_active(), 1, "stop alone must not reap");

        sys.on_tick(10);
        assert_eq!(sys.get_event(Some(t)) & 0x0020, 0);
        assert_eq!(sys.timer_num_active(), 0);
    }

    /// Scenario 5: exhaust the heap with small allocations, free every
    /// other one, and confirm a request twice the small-block size succeeds
    /// via coalescing on the next allocation walk. Deliberately exercised
    /// before `mem_kick`, so every allocation walks the whole arena (not
    /// just the small bucket) the way the literal scenario describes.
    #[test]
    fn heap_exhaustion_then_coalesced_large_message_succeeds() {
        let sys = fresh();

        let small = HeapLayout::default_const().small_blksz as u16;
        let mut allocated = 0usize;
        let mut i = 0usize;
        while let Some(m) = sys.msg_allocate(small) {
            if i % 2 == 1 {
                sys.msg_deallocate(m);
            }
            i += 1;
            allocated += 1;
        }
        assert!(allocated > 0, "heap should exhaust after enough small allocations");

        let big = sys.msg_allocate(small * 2);
        assert!(big.is_some(), "coalesced adjacent free blocks should satisfy a larger request");
        if let Some(b) = big {
            sys.msg_deallocate(b);
        }
    }

    /// Scenario 6: tasks registered before `mem_kick` behave as long-lived
    /// residents -- subsequent event/message/timer traffic for them must
    /// keep working normally once the small bucket's search cursor has
    /// moved past their control blocks.
    #[test]
    fn tasks_added_before_kick_keep_working_after_kick() {
        let sys = fresh();
        let t1 = sys.add_task(noop_init, noop_handler, 1).unwrap();
        let t2 = sys.add_task(noop_init, noop_handler, 2).unwrap();
        sys.mem_kick();

        sys.set_event(Some(t1), 1);
        sys.set_event(Some(t2), 2);
        assert_eq!(sys.get_event(Some(t1)), 1);
        assert_eq!(sys.get_event(Some(t2)), 2);

        let msg = sys.msg_allocate(4).unwrap();
        assert_eq!(sys.msg_send(Some(t1), msg), Status::Ok);
        let received = sys.msg_receive(t1).unwrap();
        assert_eq!(received.len(), 4);
        sys.msg_deallocate(received);
    }

    /// Round-trip/idempotence: `set_event; clear_event` must leave
    /// `get_event` unchanged.
    #[test]
    fn set_then_clear_event_is_idempotent() {
        let sys = fresh();
        let t = sys.add_task(noop_init, noop_handler, 1).unwrap();
        sys.mem_kick();

        let before = sys.get_event(Some(t));
        sys.set_event(Some(t), 0x0040);
        sys.clear_event(Some(t), 0x0040);
        assert_eq!(sys.get_event(Some(t)), before);
    }

    /// Round-trip/idempotence: arming then cancelling a one-shot timer
    /// before any tick leaves the active timer count unchanged.
    #[test]
    fn start_then_stop_before_tick_leaves_active_count_unchanged() {
        let sys = fresh();
        let t = sys.add_task(noop_init, noop_handler, 1).unwrap();
        sys.mem_kick();

        let before = sys.timer_num_active();
        sys.start_timer(t, 0x0080, 100, 0);
        let after_start = sys.timer_num_active();
        assert_eq!(after_start, before + 1);
        sys.stop_timer(t, 0x0080);
        // `stop_timer` only marks the node for reap; the actual unlink
        // happens on the next tick, so the count is unchanged by `stop`
        // itself.
        assert_eq!(sys.timer_num_active(), after_start);
    }
}
