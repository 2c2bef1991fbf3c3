//! Manages timeouts (timed events) and the system clock.
//!
//! # Ticks
//!
//! **A tick** is a point of time that can be used as a reference to
//! represent points of time in proximity. The first tick is created at boot
//! time. A new tick is created whenever [`PortToKernel::timer_tick`] is
//! called. It's also created when a new timeout is registered.
//!
//! The system tracks the latest tick that was created, which the system
//! will use to derive the current time by comparing the tick count
//! associated with the tick to the current value of
//! [`PortTimer::tick_count`].
//!
//! It's important to create ticks at a steady rate. This is because tick
//! counts only have a limited range (`0..=MAX_TICK_COUNT`), and we can't
//! calculate the correct duration between the current time and the last
//! tick if they are too far away.
//!
//! # Arrival times
//!
//! The arrival time of a timeout is a point on the wrapping 32-bit time
//! line. Whether it has been reached is decided by the unsigned predicate
//! `arrival - now <= DELAY_MAX` being *false* — i.e., a point less than
//! [`DELAY_MAX`] ticks in the future is pending, everything else is
//! overdue. This is robust against wrap-around provided every delay is at
//! most `DELAY_MAX` and the timer interrupt is no more than
//! `2³² - DELAY_MAX` ticks late.
//!
//! [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
//! [`PortTimer::tick_count`]: crate::PortTimer::tick_count
use core::{fmt, marker::PhantomData, marker::PhantomPinned, pin::Pin, ptr::NonNull};

use crate::{
    error::{BadParamError, TimeError},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state::expect_task_context,
    task,
    utils::{
        binary_heap::{BinaryHeap, BinaryHeapCtx, VecLike},
        Init,
    },
    KernelCfg, KernelTraits, PortThreading, UTicks,
};

// ---------------------------------------------------------------------------
// Define a singleton token type to allow the mutable access to
// `Timeout::{at, heap_pos}`.

struct TimeoutPropTag;

/// The key that "unlocks" [`TimeoutPropCell`].
type TimeoutPropToken = tokenlock::UnsyncSingletonToken<TimeoutPropTag>;
type TimeoutPropTokenRef<'a> = tokenlock::UnsyncSingletonTokenRef<'a, TimeoutPropTag>;
type TimeoutPropTokenRefMut<'a> = tokenlock::UnsyncSingletonTokenRefMut<'a, TimeoutPropTag>;

/// The keyhole type for [`tokenlock::UnsyncTokenLock`] that can be
/// "unlocked" by [`TimeoutPropToken`].
type TimeoutPropKeyhole = tokenlock::SingletonTokenId<TimeoutPropTag>;

/// Cell type that can be accessed by [`TimeoutPropToken`] (which is stored
/// next to the timeout heap and therefore is only reachable with CPU Lock
/// active).
type TimeoutPropCell<T> = tokenlock::UnsyncTokenLock<T, TimeoutPropKeyhole>;

// Types representing times
// ---------------------------------------------------------------------------

/// Represents an absolute time with a reduced range. This is also used to
/// represent a relative time span.
pub(super) type Time32 = u32;

/// The delay value representing "do not block; poll".
pub const IMMEDIATE: UTicks = 0;

/// The reserved delay value representing "no deadline".
pub const INFINITE: UTicks = UTicks::MAX;

/// The maximum relative delay accepted by the timed verbs
/// (`2³¹ - 1` ticks).
pub const DELAY_MAX: UTicks = (1 << 31) - 1;

/// The width of the window behind the current time in which an arrival time
/// is considered overdue.
const OVERDUE_HEADROOM: Time32 = DELAY_MAX + 1;

/// Validate a relative delay for a timed verb.
///
/// The caller is expected to have already dispatched `IMMEDIATE` and
/// `INFINITE` to their dedicated code paths where those values are allowed.
#[inline]
pub(super) fn time32_from_delay(delay: UTicks) -> Result<Time32, BadParamError> {
    if delay > DELAY_MAX {
        Err(BadParamError::BadParam)
    } else {
        Ok(delay)
    }
}

/// Convert an absolute deadline to a relative delay from the current time.
///
/// A deadline that is already in the past (or more than [`DELAY_MAX`] ticks
/// away, which is indistinguishable from it) yields zero, making the
/// operation behave like a poll.
#[inline]
pub(super) fn time32_until<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    at: UTicks,
) -> Time32 {
    let delta = at.wrapping_sub(current_time(lock));
    if delta > DELAY_MAX {
        0
    } else {
        delta
    }
}

// ---------------------------------------------------------------------------

/// A kernel-global state for timed event management.
pub(super) struct TimeoutGlobals<Traits, TimeoutHeap: 'static> {
    /// The value of [`PortTimer::tick_count`] on the previous "tick".
    ///
    /// [`PortTimer::tick_count`]: crate::PortTimer::tick_count
    last_tick_count: CpuLockCell<Traits, UTicks>,

    /// The time value on the previous "tick".
    last_tick_time: CpuLockCell<Traits, Time32>,

    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival time, and the `TimeoutPropToken` used to access
    /// [`Timeout`]`<Traits>`'s field contents.
    heap_and_prop_token: CpuLockCell<Traits, TimeoutHeapAndPropToken<TimeoutHeap>>,

    /// Flag indicating whether `handle_tick` is in progress or not.
    handle_tick_in_progress: CpuLockCell<Traits, bool>,
}

struct TimeoutHeapAndPropToken<TimeoutHeap: 'static> {
    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival time.
    heap: TimeoutHeap,

    /// The `TimeoutPropToken` used to access [`Timeout`]`<Traits>`'s field
    /// contents.
    prop_token: TimeoutPropToken,
}

impl<Traits, TimeoutHeap: VecLike + Init + 'static> Init
    for TimeoutGlobals<Traits, TimeoutHeap>
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        last_tick_count: Init::INIT,
        last_tick_time: Init::INIT,
        heap_and_prop_token: CpuLockCell::new(TimeoutHeapAndPropToken {
            heap: Init::INIT,
            // Safety: For each particular `Traits`, this is the only
            //         instance of `TimeoutPropToken`. If there is more than
            //         one `Traits` in a program, the singleton property of
            //         `UnsyncSingletonToken` is technically broken, but that
            //         poses no problem because a `TimeoutPropToken` of one
            //         `Traits` is never used to unlock another `Traits`'s
            //         data structures.
            prop_token: unsafe { TimeoutPropToken::new_unchecked() },
        }),
        handle_tick_in_progress: Init::INIT,
    };
}

impl<Traits: KernelTraits, TimeoutHeap: fmt::Debug> fmt::Debug
    for TimeoutGlobals<Traits, TimeoutHeap>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("last_tick_count", &self.last_tick_count)
            .field("last_tick_time", &self.last_tick_time)
            .field("handle_tick_in_progress", &self.handle_tick_in_progress)
            .finish_non_exhaustive()
    }
}

impl<TimeoutHeap: fmt::Debug> fmt::Debug for TimeoutHeapAndPropToken<TimeoutHeap> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutHeapAndPropToken")
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------

/// An internal utility to access `TimeoutGlobals`.
trait KernelTimeoutGlobalsExt: KernelTraits {
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap>;
}

impl<T: KernelTraits> KernelTimeoutGlobalsExt for T {
    /// Shortcut for `&Self::state().timeout`.
    #[inline(always)]
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap> {
        &Self::state().timeout
    }
}

// Timeouts
// ---------------------------------------------------------------------------

/// A timeout.
///
/// `Timeout` is a `!Unpin` type. Once registered by [`insert_timeout`], the
/// `Timeout` must stay in the same memory location until it's unregistered.
/// Dropping isn't allowed either. `Timeout::drop` can detect the violation
/// of this requirement and cause a panic.
///
/// `Timeout` is unregistered by one of the following ways:
///
///  - On expiration, right before its callback function is called.
///  - [`remove_timeout`] can unregister a `Timeout` at anytime. There is a
///    RAII guard type [`TimeoutGuard`] that does this automatically.
pub(super) struct Timeout<Traits: PortThreading> {
    /// The arrival time of the timeout.
    ///
    /// This is wrapped by `TimeoutPropCell` because [`TimeoutHeapCtx`]'s
    /// methods need to access this while the heap itself is mutably
    /// borrowed from its `CpuLockCell`.
    at: TimeoutPropCell<Time32>,

    /// The position of this timeout in the timeout heap.
    ///
    /// [`HEAP_POS_NONE`] indicates this timeout is not included in the heap.
    heap_pos: TimeoutPropCell<usize>,

    /// Callback function.
    callback: TimeoutFn<Traits>,

    /// Parameter given to the callback function. A cell so that an owner
    /// embedding a `Timeout` can point it back to itself after
    /// construction.
    callback_param: TimeoutPropCell<usize>,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,

    _phantom: PhantomData<Traits>,
}

/// Timeout callback function.
///
/// The callback function is called with CPU Lock active and an interrupt
/// context when the associated [`Timeout`] expires.
///
/// The callback function may wake up tasks. When it does that, it doesn't
/// have to call `unlock_cpu_and_check_preemption` or `yield_cpu` — that's
/// automatically taken care of by [`handle_tick`].
pub(super) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// Value of [`Timeout::heap_pos`] indicating the timeout is not included in
/// the heap.
const HEAP_POS_NONE: usize = usize::MAX;

impl<Traits: PortThreading> Drop for Timeout<Traits> {
    #[inline]
    fn drop(&mut self) {
        if *self.heap_pos.get_mut() != HEAP_POS_NONE {
            // The timeout is still in the heap. Dropping `self` now would
            // cause a use-after-free. Since we don't have CPU Lock and we
            // aren't sure if we can get a hold of it, panicking is the only
            // course of action we can take. The owner of `Timeout` is
            // responsible for ensuring this does not happen.
            panic!("timeout is still linked");
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}

impl<Traits: PortThreading> Timeout<Traits> {
    /// Construct a `Timeout`.
    ///
    /// The expiration time is set to zero (the origin at boot time, an
    /// unspecified time point otherwise).
    pub(super) const fn new(callback: TimeoutFn<Traits>, callback_param: usize) -> Self {
        Self {
            at: TimeoutPropCell::new(Init::INIT, 0),
            heap_pos: TimeoutPropCell::new(Init::INIT, HEAP_POS_NONE),
            callback,
            callback_param: TimeoutPropCell::new(Init::INIT, callback_param),
            _pin: PhantomPinned,
            _phantom: PhantomData,
        }
    }
}

impl<Traits: PortThreading> Init for Timeout<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(|_, x| x, 0);
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Get a flag indicating whether the `Timeout` is currently in the heap.
    pub(super) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let prop_token = &Traits::g_timeout()
            .heap_and_prop_token
            .read(&*lock)
            .prop_token;

        *self.heap_pos.read(prop_token) != HEAP_POS_NONE
    }

    /// Configure the `Timeout` to expire in the specified duration.
    pub(super) fn set_expiration_after(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        duration_time32: Time32,
    ) {
        debug_assert!(duration_time32 <= DELAY_MAX);

        let current_time = current_time(lock.borrow_mut());
        let at = current_time.wrapping_add(duration_time32);

        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        *self.at.write(prop_token) = at;
    }

    /// Adjust the `Timeout`'s expiration time.
    ///
    /// Intended to be used by periodic events before re-registering the
    /// `Timeout`.
    pub(super) fn adjust_expiration(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        duration_time32: Time32,
    ) {
        debug_assert!(duration_time32 <= DELAY_MAX);

        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        self.at
            .replace_with(prop_token, |x| x.wrapping_add(duration_time32));
    }

    #[inline]
    pub(super) fn saturating_duration_until_timeout(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Time32 {
        let current_time = current_time(lock.borrow_mut());

        let prop_token = &Traits::g_timeout()
            .heap_and_prop_token
            .read(&*lock)
            .prop_token;

        saturating_duration_until_timeout(self, current_time, prop_token.borrow())
    }

    /// Get the raw expiration time.
    ///
    /// This is also used for storing arbitrary data (e.g., a saved delay
    /// value) in an unlinked `Timeout`.
    pub(super) fn at_raw(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Time32 {
        let prop_token = &Traits::g_timeout()
            .heap_and_prop_token
            .read(&*lock)
            .prop_token;

        *self.at.read(prop_token)
    }

    /// Set the raw expiration time.
    pub(super) fn set_at_raw(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, value: Time32) {
        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        *self.at.write(prop_token) = value;
    }

    /// Set the parameter passed to the callback function.
    pub(super) fn set_callback_param(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        value: usize,
    ) {
        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        *self.callback_param.write(prop_token) = value;
    }
}

/// A reference to a [`Timeout`].
#[doc(hidden)]
pub struct TimeoutRef<Traits: PortThreading>(NonNull<Timeout<Traits>>);

// Safety: `Timeout` is only accessed with CPU Lock active
unsafe impl<Traits: PortThreading> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for TimeoutRef<Traits> {}

impl<Traits: PortThreading> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for TimeoutRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

/// Used when manipulating the timeout heap. Provides the correct comparator
/// function for [`Timeout`]s. Ensures [`Timeout::heap_pos`] is up-to-date.
struct TimeoutHeapCtx<'a> {
    critical_point: Time32,
    prop_token: TimeoutPropTokenRefMut<'a>,
}

impl<Traits: PortThreading> BinaryHeapCtx<TimeoutRef<Traits>> for TimeoutHeapCtx<'_> {
    #[inline]
    fn lt(&mut self, x: &TimeoutRef<Traits>, y: &TimeoutRef<Traits>) -> bool {
        // Safety: `x` and `y` are in the heap, so the pointees must be valid
        let (x, y) = unsafe {
            (
                *x.0.as_ref().at.read(&*self.prop_token),
                *y.0.as_ref().at.read(&*self.prop_token),
            )
        };
        let critical_point = self.critical_point;
        x.wrapping_sub(critical_point) < y.wrapping_sub(critical_point)
    }

    #[inline]
    fn on_move(&mut self, e: &mut TimeoutRef<Traits>, new_index: usize) {
        // Safety: `e` is in the heap, so the pointee must be valid
        unsafe { e.0.as_ref() }
            .heap_pos
            .replace(&mut *self.prop_token, new_index);
    }
}

// Initialization
// ---------------------------------------------------------------------------

impl<Traits: KernelTraits, TimeoutHeap> TimeoutGlobals<Traits, TimeoutHeap> {
    /// Initialize the timekeeping system.
    pub(super) fn init(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        // Mark the first "tick"
        // Safety: CPU Lock active
        self.last_tick_count
            .replace(&mut *lock.borrow_mut(), unsafe { Traits::tick_count() });

        // Schedule the next tick. There are no timeouts registered at the
        // moment, so use `MAX_TIMEOUT`.
        // Safety: CPU Lock active
        unsafe { Traits::pend_tick_after(Traits::MAX_TIMEOUT) };
    }
}

// Global time management
// ---------------------------------------------------------------------------

/// Implements [`System::time`].
///
/// [`System::time`]: crate::System::time
pub(super) fn system_time<Traits: KernelTraits>() -> Result<UTicks, TimeError> {
    expect_task_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;

    Ok(current_time(lock.borrow_mut()))
}

/// Calculate the elapsed time since the last tick.
///
/// Returns two values:
///
///  1. The duration in range `0..=Traits::MAX_TICK_COUNT`.
///  2. The value of `Traits::tick_count()` used for calculation.
#[inline]
fn duration_since_last_tick<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> (Time32, UTicks) {
    // Safety: CPU Lock active
    let tick_count = unsafe { Traits::tick_count() };

    let last_tick_count = Traits::g_timeout().last_tick_count.get(&*lock.borrow_mut());

    // Guess the current time, taking the wrap-around behavior into account.
    // Basically, we want to find the smallest value of `time`
    // (≥ `last_tick_time`) that satisfies the following equation:
    //
    //     (last_tick_count + (time - last_tick_time)) % (MAX_TICK_COUNT + 1)
    //       == tick_count
    //
    let elapsed = if Traits::MAX_TICK_COUNT == UTicks::MAX || tick_count >= last_tick_count {
        // last_tick_count    tick_count
        // ┌──────┴────────────────┴────────┬───────────┐
        // 0      ╚════════════════╝  MAX_TICK_COUNT   MAX
        //              elapsed
        tick_count.wrapping_sub(last_tick_count)
    } else {
        //   tick_count     last_tick_count
        // ┌──────┴────────────────┴────────┬───────────┐
        // 0 ═════╝                ╚════════           MAX
        //                          elapsed
        tick_count.wrapping_sub(last_tick_count) - (UTicks::MAX - Traits::MAX_TICK_COUNT)
    };

    (elapsed, tick_count)
}

/// Create a tick now.
fn mark_tick<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let (duration_since_last_tick, tick_count) =
        duration_since_last_tick::<Traits>(lock.borrow_mut());

    let g_timeout = Traits::g_timeout();
    g_timeout.last_tick_count.replace(&mut *lock, tick_count);
    g_timeout
        .last_tick_time
        .replace_with(&mut *lock, |old_value| {
            old_value.wrapping_add(duration_since_last_tick)
        });
}

/// Implements [`PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
#[inline]
pub(super) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = lock_cpu::<Traits>().unwrap();

    mark_tick(lock.borrow_mut());

    let g_timeout = Traits::g_timeout();
    let current_time = g_timeout.last_tick_time.get(&*lock);
    let critical_point = critical_point(current_time);

    // Set `handle_tick_in_progress`. This will suppress redundant calls to
    // `pend_next_tick` made by timeout handlers.
    g_timeout.handle_tick_in_progress.replace(&mut *lock, true);

    // Process expired timeouts.
    //
    // For each iteration, check the top element (representing the earliest
    // timeout) in the heap. Exit from the loop if the heap is empty.
    while let Some(&timeout_ref) = g_timeout.heap_and_prop_token.read(&*lock).heap.get(0) {
        // Safety: `timeout_ref` is in the heap, meaning the pointee is valid
        let timeout = unsafe { &*timeout_ref.0.as_ptr() };

        let TimeoutHeapAndPropToken { heap, prop_token } =
            g_timeout.heap_and_prop_token.write(&mut *lock);

        // How much time do we have before `timeout` becomes overdue?
        let remaining =
            saturating_duration_until_timeout(timeout, current_time, prop_token.borrow());
        if remaining > 0 {
            break;
        }

        // The timeout has expired. Remove it from the heap.
        let callback = timeout.callback;
        let callback_param = *timeout.callback_param.read(prop_token);

        debug_assert_eq!(*timeout.heap_pos.read(prop_token), 0);
        timeout.heap_pos.replace(prop_token, HEAP_POS_NONE);

        heap.heap_remove(
            0,
            TimeoutHeapCtx {
                critical_point,
                prop_token: prop_token.borrow_mut(),
            },
        );

        // (Note: `timeout` is considered invalid at this point because it's
        // not in the heap anymore)

        // Call the callback function.
        lock = callback(callback_param, lock);
    }

    g_timeout.handle_tick_in_progress.replace(&mut *lock, false);

    // Schedule the next tick
    pend_next_tick(lock.borrow_mut(), current_time);

    // Callback functions might have woken up some tasks. Check for dispatch
    // and release CPU Lock.
    task::unlock_cpu_and_check_preemption(lock);
}

/// Get the current time.
pub(super) fn current_time<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Time32 {
    let (duration_since_last_tick, _) = duration_since_last_tick::<Traits>(lock.borrow_mut());

    let g_timeout = Traits::g_timeout();
    g_timeout
        .last_tick_time
        .get(&*lock)
        .wrapping_add(duration_since_last_tick)
}

/// Schedule the next tick.
fn pend_next_tick<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    current_time: Time32,
) {
    let mut delay = Traits::MAX_TIMEOUT;

    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.read(&*lock);

    // Check the top element (representing the earliest timeout) in the heap
    if let Some(&timeout_ref) = heap.get(0) {
        // Safety: `timeout_ref` is in the heap, meaning the pointee is valid
        let timeout = unsafe { timeout_ref.0.as_ref() };

        // How much time do we have before `timeout` becomes overdue?
        delay = delay.min(saturating_duration_until_timeout(
            timeout,
            current_time,
            prop_token.borrow(),
        ));
    }

    // Safety: CPU Lock active
    unsafe {
        if delay == 0 {
            Traits::pend_tick();
        } else {
            Traits::pend_tick_after(delay);
        }
    }
}

// Timeout management
// ---------------------------------------------------------------------------

/// Find the critical point (the earliest representable arrival time) based
/// on the current time.
#[inline]
fn critical_point(current_time: Time32) -> Time32 {
    current_time.wrapping_sub(OVERDUE_HEADROOM)
}

/// Calculate the duration until the specified timeout is reached. Returns
/// `0` if the timeout is already overdue.
fn saturating_duration_until_timeout<Traits: PortThreading>(
    timeout: &Timeout<Traits>,
    current_time: Time32,
    prop_token: TimeoutPropTokenRef<'_>,
) -> Time32 {
    let duration = timeout.at.read(&*prop_token).wrapping_sub(current_time);
    if duration > DELAY_MAX {
        // The arrival time is in the overdue window behind `current_time`
        0
    } else {
        duration
    }
}

/// Register the specified timeout.
pub(super) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: Pin<&Timeout<Traits>>,
) {
    // This check is important for memory safety. For each `Timeout`, there
    // can be only one heap entry pointing to that `Timeout`. `heap_pos`
    // indicates whether there's a corresponding heap entry or not. If we let
    // two entries reside in the heap, when we remove the first one, we would
    // falsely flag the `Timeout` as "not in the heap". If we drop the
    // `Timeout` in this state, the second entry would still be referencing
    // the no-longer existent `Timeout`.
    let prop_token = &Traits::g_timeout()
        .heap_and_prop_token
        .read(&*lock)
        .prop_token;
    assert_eq!(
        *timeout.heap_pos.read(prop_token),
        HEAP_POS_NONE,
        "timeout is already registered",
    );

    let current_time = current_time(lock.borrow_mut());
    let critical_point = critical_point(current_time);

    // Insert a reference to `timeout` into the heap
    //
    // `Timeout` is `!Unpin` and `Timeout::drop` ensures it's not dropped
    // while it's still in the heap, so `*timeout` will never be leaked¹
    // while being referenced by the heap. Therefore, it's safe to insert a
    // reference to `*timeout` into the heap.
    //
    //  ¹ Rust jargon meaning destroying an object without running its
    //    destructor.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    let pos = heap.heap_push(
        TimeoutRef((&*timeout).into()),
        TimeoutHeapCtx {
            critical_point,
            prop_token: prop_token.borrow_mut(),
        },
    );

    // `TimeoutHeapCtx::on_move` should have assigned `heap_pos`
    debug_assert_eq!(*timeout.heap_pos.read(prop_token), pos);

    if !Traits::g_timeout().handle_tick_in_progress.get(&*lock) {
        // (Re-)schedule the next tick
        pend_next_tick(lock, current_time);
    }
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered.
#[inline]
pub(super) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    remove_timeout_inner(lock.borrow_mut(), timeout);

    let prop_token = &mut Traits::g_timeout()
        .heap_and_prop_token
        .write(&mut *lock)
        .prop_token;

    // Reset `heap_pos` here so that the compiler can eliminate the check in
    // `Timeout::drop` when a `remove_timeout` call dominates the drop site.
    timeout.heap_pos.replace(prop_token, HEAP_POS_NONE);
}

fn remove_timeout_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    let current_time = current_time(lock.borrow_mut());
    let critical_point = critical_point(current_time);

    // Remove `timeout` from the heap
    //
    // If `heap_pos == HEAP_POS_NONE`, we are supposed to do nothing.
    // `HEAP_POS_NONE` is a huge value, so `heap_remove` will inevitably
    // reject such a huge value by bounds check. This way, we can check both
    // for bounds and `HEAP_POS_NONE` in one fell swoop.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    let heap_pos = *timeout.heap_pos.read(prop_token);

    let timeout_ref = heap.heap_remove(
        heap_pos,
        TimeoutHeapCtx {
            critical_point,
            prop_token: prop_token.borrow_mut(),
        },
    );

    if timeout_ref.is_none() {
        // The cause of failure must be `timeout` not being registered in
        // the first place.
        debug_assert_eq!(heap_pos, HEAP_POS_NONE);
        return;
    }

    // The removed element should have pointed to `timeout`
    debug_assert_eq!(
        timeout_ref.unwrap().0.as_ptr() as *const _,
        timeout as *const _
    );

    if !Traits::g_timeout().handle_tick_in_progress.get(&*lock) {
        // (Re-)schedule the next tick
        pend_next_tick(lock, current_time);
    }
}

/// RAII guard that automatically unregisters `Timeout` when dropped.
pub(super) struct TimeoutGuard<'a, 'b, Traits: KernelTraits> {
    pub(super) timeout: Pin<&'a Timeout<Traits>>,
    pub(super) lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: KernelTraits> Drop for TimeoutGuard<'_, '_, Traits> {
    #[inline]
    fn drop(&mut self) {
        remove_timeout(self.lock.borrow_mut(), &self.timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_validation() {
        assert_eq!(time32_from_delay(0).unwrap(), 0);
        assert_eq!(time32_from_delay(DELAY_MAX).unwrap(), DELAY_MAX);
        assert!(time32_from_delay(DELAY_MAX + 1).is_err());
        assert!(time32_from_delay(INFINITE).is_err());
    }

    #[test]
    fn overdue_predicate() {
        // `arrival - now > DELAY_MAX` means overdue, robust to wrap-around
        fn overdue(arrival: Time32, now: Time32) -> bool {
            arrival.wrapping_sub(now) > DELAY_MAX
        }

        assert!(!overdue(100, 50));
        assert!(overdue(50, 100));
        assert!(!overdue(0x8000_0000, 0x7fff_ffff));
        assert!(overdue(0x7fff_ffff, 0x8000_0000));
        // Near the wrap-around point
        assert!(!overdue(5, u32::MAX - 5));
        assert!(overdue(u32::MAX - 5, 5));
    }
}
