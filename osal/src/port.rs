//! The platform port boundary.
//!
//! Everything in this module is an opaque operation the core calls but never
//! implements itself. A port provides interrupt masking, nestable critical
//! sections, and a periodic tick source; see `osal_port_std::StdPort` in the
//! separate `osal-port-std` crate for the Linux simulation host
//! implementation of this trait.

use core::cell::UnsafeCell;

/// Operations a platform must provide for the core to run on it.
///
/// `enter_critical`/`exit_critical` must nest via save/restore of the
/// previous interrupt-enable state, not via a counter: restoring a state
/// captured before a nested `enter_critical` call must leave interrupts in
/// whatever state they were actually in at that point, even if an outer
/// critical section is still logically active.
pub trait Port {
    /// Opaque snapshot of the interrupt-enable state, returned by
    /// [`Port::enter_critical`] and consumed by [`Port::exit_critical`].
    type CriticalState: Copy;

    /// Globally enable interrupts.
    fn enable_interrupts();
    /// Globally disable interrupts.
    fn disable_interrupts();
    /// Query whether interrupts are currently enabled.
    fn interrupts_enabled() -> bool;

    /// Disable interrupts, returning a token that restores the previous
    /// state when passed to [`Port::exit_critical`].
    fn enter_critical() -> Self::CriticalState;
    /// Restore the interrupt-enable state captured by a matching
    /// [`Port::enter_critical`] call.
    fn exit_critical(state: Self::CriticalState);

    /// Arrange for [`crate::Os::on_tick`] to be called at a fixed period.
    /// Does not by itself start ticking; see [`Port::tick_start`].
    fn tick_init();
    /// Start the periodic tick.
    fn tick_start();
    /// Stop the periodic tick.
    fn tick_stop();
}

/// A cell whose contents may only be touched from inside a critical
/// section.
///
/// This replaces the compile-time aliasing proof that a fully generic
/// const-eval kernel configuration would use (see `tokenlock`-based
/// designs) with a plain [`UnsafeCell`]: there is exactly one port
/// implementation linked into a given binary, so the extra type-level
/// machinery buys nothing here. The safety argument is the same one the
/// original C core relies on: every access happens between
/// `enter_critical`/`exit_critical`, so no two accesses ever overlap.
pub(crate) struct CriticalCell<T>(UnsafeCell<T>);

// Safety: all access to the contents goes through `with`, which brackets the
// closure with `P::enter_critical`/`P::exit_critical`.
unsafe impl<T> Sync for CriticalCell<T> {}

impl<T> CriticalCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Run `f` with exclusive access to the cell's contents, masking
    /// interrupts for the duration.
    #[inline]
    pub(crate) fn with<P: Port, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let state = P::enter_critical();
        // Safety: interrupts are masked for the lifetime of `f`, and the
        // rest of the core never holds a reference across a call that could
        // re-enter a critical section on the same cell.
        let r = f(unsafe { &mut *self.0.get() });
        P::exit_critical(state);
        r
    }
}
