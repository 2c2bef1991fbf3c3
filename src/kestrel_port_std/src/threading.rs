//! Threading library similar to `std::thread` but with a race-free,
//! spurious-wakeup-free park operation.
//!
//! Unlike `std::thread::park`, a park token here is a plain mutex-protected
//! flag, so a worker can only be resumed by an explicit [`Thread::unpark`]
//! — exactly the discipline the user-mode scheduler needs.
use std::cell::RefCell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// A handle to a thread created by [`spawn`].
#[derive(Debug, Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// `true` if the thread has been granted permission to run.
    token: Mutex<bool>,
    condvar: Condvar,
}

thread_local! {
    static CURRENT: RefCell<Option<Thread>> = RefCell::new(None);
}

/// Spawn a new thread. The spawned thread is detached; its completion is
/// tracked by the caller through other means.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> Thread {
    let inner = Arc::new(Inner {
        token: Mutex::new(false),
        condvar: Condvar::new(),
    });
    let thread = Thread {
        inner: Arc::clone(&inner),
    };
    let thread2 = thread.clone();

    thread::spawn(move || {
        CURRENT.with(|c| *c.borrow_mut() = Some(thread2));
        f();
    });

    thread
}

/// Block the current thread until its token is made available by
/// [`Thread::unpark`]. If the token is already available, consume it and
/// return immediately.
///
/// Panics if the current thread wasn't created by [`spawn`].
pub fn park() {
    let thread = CURRENT.with(|c| c.borrow().clone());
    let thread = thread.expect("current thread wasn't created by `threading::spawn`");

    let mut token = thread.inner.token.lock().unwrap();
    while !*token {
        token = thread.inner.condvar.wait(token).unwrap();
    }
    *token = false;
}

impl Thread {
    /// Make the thread's park token available, unblocking a pending or
    /// future [`park`].
    pub fn unpark(&self) {
        let mut token = self.inner.token.lock().unwrap();
        *token = true;
        self.inner.condvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn unpark_before_park() {
        let (send, recv) = mpsc::channel();
        let (ready_send, ready_recv) = mpsc::channel();

        let thread = spawn(move || {
            let me: Thread = ready_recv.recv().unwrap();
            // The token was made available before this `park`
            me.unpark();
            park();
            send.send(()).unwrap();
        });

        ready_send.send(thread).unwrap();
        recv.recv().unwrap();
    }

    #[test]
    fn park_then_unpark() {
        let (send, recv) = mpsc::channel();

        let thread = spawn(move || {
            park();
            send.send(1).unwrap();
            park();
            send.send(2).unwrap();
        });

        assert!(recv.try_recv().is_err());
        thread.unpark();
        assert_eq!(recv.recv().unwrap(), 1);
        thread.unpark();
        assert_eq!(recv.recv().unwrap(), 2);
    }
}
