//! Linux/macOS host simulation port for [`osal`].
//!
//! Critical sections are backed by a real lock rather than actual
//! interrupt masking (there is no interrupt controller to mask on a host
//! OS, and unlike a single-core microcontroller this process has a second
//! thread genuinely running concurrently: the tick thread). The tick
//! source itself is that background thread, sleeping
//! [`TICK_PERIOD_MS`] and calling back into the scheduler -- the same
//! shape as the original core's `hal_tick.c`, which spins up a pthread
//! that sleeps and calls `osal_update_timers()` in a loop.

use std::cell::Cell;
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;
use osal::Port;

/// Tick period, in milliseconds. Matches `HAL_TICK_PERIOD_MS` from the
/// original Linux host port.
pub const TICK_PERIOD_MS: u64 = 10;

static CRITICAL: spin::Mutex<bool> = spin::Mutex::new(true);
static TICK_SINK: OnceCell<fn(u16)> = OnceCell::new();

thread_local! {
    // Depth of `enter_critical` calls made by *this* thread that haven't
    // been matched by `exit_critical` yet. Only the thread that takes
    // `CRITICAL` from 0 to 1 actually locks it; deeper calls reuse the
    // pointer stashed in `SLOT`.
    static DEPTH: Cell<u32> = const { Cell::new(0) };
    static SLOT: Cell<*mut bool> = const { Cell::new(core::ptr::null_mut()) };
}

/// Opaque critical-section token for [`StdPort`].
///
/// Pairs with the [`DEPTH`]/[`SLOT`] thread-locals: `exit_critical` must be
/// called on the same thread that produced the token, in the reverse order
/// of the matching `enter_critical` calls (stack discipline), exactly like
/// the original `hal_reg_t cpu_sr` save/restore pattern.
#[derive(Clone, Copy)]
pub struct CriticalToken {
    prev_enabled: bool,
    depth_after_enter: u32,
}

/// The host simulation port. Implements [`Port`] for a single process;
/// only ever instantiate one [`osal::Os`] against it.
pub struct StdPort;

impl StdPort {
    /// Register the function the tick thread calls every
    /// [`TICK_PERIOD_MS`]. Must be called once, before [`Port::tick_init`]
    /// -- typically the registered function is `Os::on_tick` bound to a
    /// particular `'static` system instance.
    pub fn set_tick_sink(sink: fn(u16)) {
        if TICK_SINK.set(sink).is_err() {
            log::warn!("osal tick sink registered twice; keeping the first one");
        }
    }
}

/// Run `f` against the shared "interrupts enabled" flag, taking the real
/// lock only if this thread isn't already holding it -- calling
/// `enable_interrupts`/`disable_interrupts`/`interrupts_enabled` from
/// inside an already-held critical section must not deadlock against
/// one's own lock.
fn with_enabled<R>(f: impl FnOnce(&mut bool) -> R) -> R {
    if DEPTH.with(Cell::get) > 0 {
        let slot = SLOT.with(Cell::get);
        // Safety: depth > 0 means this thread holds `CRITICAL` and `slot`
        // points at the bool it guards.
        unsafe { f(&mut *slot) }
    } else {
        let mut guard = CRITICAL.lock();
        f(&mut guard)
    }
}

impl Port for StdPort {
    type CriticalState = CriticalToken;

    fn enable_interrupts() {
        with_enabled(|v| *v = true);
    }

    fn disable_interrupts() {
        with_enabled(|v| *v = false);
    }

    fn interrupts_enabled() -> bool {
        with_enabled(|v| *v)
    }

    fn enter_critical() -> CriticalToken {
        let depth = DEPTH.with(Cell::get);
        if depth == 0 {
            let guard = CRITICAL.lock();
            let prev = *guard;
            let slot: &mut bool = spin::MutexGuard::leak(guard);
            *slot = false;
            SLOT.with(|s| s.set(slot as *mut bool));
            DEPTH.with(|d| d.set(1));
            CriticalToken {
                prev_enabled: prev,
                depth_after_enter: 1,
            }
        } else {
            let slot = SLOT.with(Cell::get);
            // Safety: this thread already owns the lock (depth > 0), and
            // `slot` was stashed by that same thread's outermost
            // `enter_critical` call.
            let prev = unsafe { *slot };
            unsafe { *slot = false };
            let new_depth = depth + 1;
            DEPTH.with(|d| d.set(new_depth));
            CriticalToken {
                prev_enabled: prev,
                depth_after_enter: new_depth,
            }
        }
    }

    fn exit_critical(token: CriticalToken) {
        let slot = SLOT.with(Cell::get);
        // Safety: `slot` is still valid because depth hasn't reached zero
        // yet (we check below, after writing through it) and only the
        // owning thread ever reads or writes it.
        unsafe { *slot = token.prev_enabled };
        let new_depth = token.depth_after_enter - 1;
        DEPTH.with(|d| d.set(new_depth));
        if new_depth == 0 {
            SLOT.with(|s| s.set(core::ptr::null_mut()));
            // Safety: we are the thread that holds `CRITICAL` (depth just
            // returned to zero), and the guard was leaked by this thread's
            // outermost `enter_critical`.
            unsafe { CRITICAL.force_unlock() };
        }
    }

    fn tick_init() {
        thread::Builder::new()
            .name("osal-tick".into())
            .spawn(|| loop {
                thread::sleep(Duration::from_millis(TICK_PERIOD_MS));
                match TICK_SINK.get() {
                    Some(sink) => sink(TICK_PERIOD_MS as u16),
                    None => log::trace!("tick fired with no sink registered yet"),
                }
            })
            .expect("failed to spawn osal tick thread");
        log::debug!("host tick thread started ({TICK_PERIOD_MS} ms period)");
    }

    // The original Linux port leaves these empty: the tick thread runs
    // continuously once started and is never paused.
    fn tick_start() {}
    fn tick_stop() {}
}
