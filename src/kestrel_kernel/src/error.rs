//! Error codes returned by the kernel services.
use core::fmt;

/// The process-wide result alphabet. Every fallible kernel service returns
/// an error enum whose variants are drawn from (and numerically equal to)
/// this set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResultCode {
    /// The operation completed normally.
    Success = 0,
    /// The waited-on object was killed.
    Stopped = 1,
    /// The deadline was reached before the wait condition was satisfied.
    /// Also returned by polling verbs whose condition doesn't hold.
    Timeout = 2,
    /// The operation failed for an unspecified reason.
    Failure = 3,
    /// The calling task does not own the mutex.
    NotOwner = 4,
    /// The operation would deadlock on a mutex.
    Deadlock = 5,
    /// A counter or buffer capacity would be exceeded.
    Overflow = 6,
    /// The current execution context disallows the operation.
    BadContext = 7,
    /// A parameter is invalid.
    BadParam = 8,
    /// The object is not in a state that allows the operation.
    BadObjectState = 9,
}

impl ResultCode {
    /// Get the short name of the result code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Stopped => "Stopped",
            Self::Timeout => "Timeout",
            Self::Failure => "Failure",
            Self::NotOwner => "NotOwner",
            Self::Deadlock => "Deadlock",
            Self::Overflow => "Overflow",
            Self::BadContext => "BadContext",
            Self::BadParam => "BadParam",
            Self::BadObjectState => "BadObjectState",
        }
    }
}

impl fmt::Debug for ResultCode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! define_error_intos {
    ($Name:ident { $( $Variant:ident ),* } ; ) => {};
    ($Name:ident { $( $Variant:ident ),* } ; $Super:path $(, $Rest:path)* $(,)? ) => {
        impl From<$Name> for $Super {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
        define_error_intos!($Name { $( $Variant ),* } ; $( $Rest ),* );
    };
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Super:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(u8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as u8 ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error_intos!($Name { $( $Variant ),* } ; $( $Super ),* );
    };
}

define_error! {
    /// Error type for blocking operations without a timeout.
    pub enum WaitError {
        BadContext,
        Stopped,
    }
}

define_error! {
    /// Error type for blocking operations with a timeout.
    pub enum WaitTimeoutError {
        BadContext,
        BadParam,
        Stopped,
        Timeout,
    }
}

define_error! {
    /// Error type for non-blocking (polling) acquisition verbs.
    pub enum PollError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for state queries.
    pub enum GetError {
        BadContext,
    }
}

define_error! {
    /// Error type for state-updating verbs that cannot fail otherwise.
    pub enum UpdateError {
        BadContext,
    }
}

define_error! {
    /// Error type for `kill`.
    pub enum KillError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`System::acquire_cpu_lock`].
    ///
    /// [`System::acquire_cpu_lock`]: crate::System::acquire_cpu_lock
    pub enum CpuLockError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`System::time`].
    ///
    /// [`System::time`]: crate::System::time
    pub enum TimeError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`System::sleep_for`].
    ///
    /// [`System::sleep_for`]: crate::System::sleep_for
    pub enum SleepError {
        BadContext,
        BadParam,
    }
}

define_error! {
    /// Error type for [`TaskCb::activate`].
    ///
    /// [`TaskCb::activate`]: crate::TaskCb::activate
    pub enum ActivateTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`TaskCb::set_priority`].
    ///
    /// [`TaskCb::set_priority`]: crate::TaskCb::set_priority
    pub enum SetTaskPriorityError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`TaskCb::priority`].
    ///
    /// [`TaskCb::priority`]: crate::TaskCb::priority
    pub enum GetTaskPriorityError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for the semaphore `give` family.
    pub enum SignalSemaphoreError {
        BadContext,
        Overflow,
    }
}

define_error! {
    /// Error type for [`TimerCb::start`].
    ///
    /// [`TimerCb::start`]: crate::TimerCb::start
    pub enum StartTimerError {
        BadContext,
        BadParam,
    }
}

define_error! {
    /// Error type for untimed mutex acquisition.
    pub enum LockMutexError {
        BadContext,
        Stopped,
        Deadlock,
    }
}

define_error! {
    /// Error type for timed mutex acquisition.
    pub enum LockMutexTimeoutError {
        BadContext,
        BadParam,
        Stopped,
        Timeout,
        Deadlock,
    }
}

define_error! {
    /// Error type for non-blocking mutex acquisition.
    pub enum TryLockMutexError {
        BadContext,
        Timeout,
        Deadlock,
    }
}

define_error! {
    /// Error type for mutex release.
    pub enum UnlockMutexError {
        BadContext,
        NotOwner,
    }
}

define_error! {
    /// Error type for non-blocking sends into bounded buffers.
    pub enum SendError {
        BadContext,
        Timeout,
        Overflow,
    }
}

define_error! {
    /// Error type for timed sends into bounded buffers.
    pub enum SendTimeoutError {
        BadContext,
        BadParam,
        Stopped,
        Timeout,
        Overflow,
    }
}

// Sub-errors used internally to compose the public error types
// ---------------------------------------------------------------------------

define_error! {
    /// `BadContext`
    #[into(WaitError)]
    #[into(WaitTimeoutError)]
    #[into(PollError)]
    #[into(GetError)]
    #[into(UpdateError)]
    #[into(KillError)]
    #[into(CpuLockError)]
    #[into(TimeError)]
    #[into(SleepError)]
    #[into(ActivateTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskPriorityError)]
    #[into(SignalSemaphoreError)]
    #[into(StartTimerError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(SendError)]
    #[into(SendTimeoutError)]
    pub(super) enum BadContextError {
        BadContext,
    }
}

define_error! {
    /// Error conditions detected before a mutex acquisition suspends the
    /// caller. Used internally by the mutex implementation.
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    pub(super) enum LockMutexPrecheckError {
        Deadlock,
    }
}

define_error! {
    /// `BadParam`
    #[into(WaitTimeoutError)]
    #[into(SleepError)]
    #[into(StartTimerError)]
    #[into(LockMutexTimeoutError)]
    #[into(SendTimeoutError)]
    pub(super) enum BadParamError {
        BadParam,
    }
}

define_error! {
    /// The reason a wait operation was ended by someone other than a regular
    /// wake-upper. Stored in the waiting task's wait-result slot.
    #[into(WaitTimeoutError)]
    #[into(LockMutexTimeoutError)]
    #[into(SendTimeoutError)]
    pub(crate) enum AbortReason {
        Stopped,
        Timeout,
    }
}

impl From<WaitError> for WaitTimeoutError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::BadContext => Self::BadContext,
            WaitError::Stopped => Self::Stopped,
        }
    }
}

impl From<LockMutexError> for LockMutexTimeoutError {
    #[inline]
    fn from(x: LockMutexError) -> Self {
        match x {
            LockMutexError::BadContext => Self::BadContext,
            LockMutexError::Stopped => Self::Stopped,
            LockMutexError::Deadlock => Self::Deadlock,
        }
    }
}

impl From<WaitTimeoutError> for LockMutexTimeoutError {
    #[inline]
    fn from(x: WaitTimeoutError) -> Self {
        match x {
            WaitTimeoutError::BadContext => Self::BadContext,
            WaitTimeoutError::BadParam => Self::BadParam,
            WaitTimeoutError::Stopped => Self::Stopped,
            WaitTimeoutError::Timeout => Self::Timeout,
        }
    }
}

impl From<WaitTimeoutError> for SendTimeoutError {
    #[inline]
    fn from(x: WaitTimeoutError) -> Self {
        match x {
            WaitTimeoutError::BadContext => Self::BadContext,
            WaitTimeoutError::BadParam => Self::BadParam,
            WaitTimeoutError::Stopped => Self::Stopped,
            WaitTimeoutError::Timeout => Self::Timeout,
        }
    }
}

impl From<WaitError> for LockMutexError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::BadContext => Self::BadContext,
            WaitError::Stopped => Self::Stopped,
        }
    }
}

impl From<WaitError> for SendTimeoutError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::BadContext => Self::BadContext,
            WaitError::Stopped => Self::Stopped,
        }
    }
}

/// Convert `self` to [`AbortReason::Stopped`]'s untimed counterpart,
/// panicking if `self == Self::Timeout`, which should never happen for a
/// wait operation with no timeout.
#[inline]
pub(super) fn expect_not_timeout(e: AbortReason) -> WaitError {
    match e {
        AbortReason::Stopped => WaitError::Stopped,
        AbortReason::Timeout => unreachable!("got timeout result for a non-timeout wait"),
    }
}
