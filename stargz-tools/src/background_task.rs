//! Arbitration between prioritized and background work.
//!
//! Foreground filesystem reads must never wait for bulk prefetching. The
//! manager keeps two in-flight counters behind a mutex: prioritized tasks
//! enter unconditionally, background tasks are admitted only while no
//! prioritized task is running, a quiet window has elapsed since the last
//! one finished, and the background concurrency bound has headroom.
//!
//! Admitted background tasks receive a [`CancelToken`] which trips as soon
//! as any prioritized task starts or the task's deadline expires. Tasks are
//! expected to poll it at their I/O boundaries and bail out promptly; a
//! cancelled task simply gets re-admitted once the manager is quiet again.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default wait after the last prioritized task before background work resumes.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(5);
/// Default bound on concurrently running background tasks.
pub const DEFAULT_MAX_BACKGROUND: usize = 2;

struct State {
    priority_in_flight: usize,
    background_in_flight: usize,
    last_priority_end: Instant,
}

pub struct BackgroundTaskManager {
    state: Mutex<State>,
    cond: Condvar,
    quiet_window: Duration,
    max_background: usize,
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKGROUND, DEFAULT_QUIET_WINDOW)
    }
}

impl BackgroundTaskManager {
    pub fn new(max_background: usize, quiet_window: Duration) -> Self {
        let max_background = max_background.max(1);
        Self {
            state: Mutex::new(State {
                priority_in_flight: 0,
                background_in_flight: 0,
                // an idle manager admits background work right away
                last_priority_end: Instant::now()
                    .checked_sub(quiet_window)
                    .unwrap_or_else(Instant::now),
            }),
            cond: Condvar::new(),
            quiet_window,
            max_background,
        }
    }

    /// Enter a prioritized section. Never blocks.
    pub fn begin_priority(self: &Arc<Self>) -> PriorityGuard {
        self.state.lock().unwrap().priority_in_flight += 1;
        PriorityGuard {
            mgr: Arc::clone(self),
        }
    }

    fn end_priority(&self) {
        let mut st = self.state.lock().unwrap();
        st.priority_in_flight -= 1;
        st.last_priority_end = Instant::now();
        drop(st);
        self.cond.notify_all();
    }

    fn priority_active(&self) -> bool {
        self.state.lock().unwrap().priority_in_flight > 0
    }

    /// Run `f` as a background task.
    ///
    /// Blocks until the manager admits the task, then invokes `f` on the
    /// calling thread with a token that cancels on the next prioritized
    /// task or after `timeout`.
    pub fn run_background<T>(
        self: &Arc<Self>,
        timeout: Duration,
        f: impl FnOnce(&CancelToken) -> T,
    ) -> T {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.priority_in_flight == 0 && st.background_in_flight < self.max_background {
                let quiet_at = st.last_priority_end + self.quiet_window;
                let now = Instant::now();
                if now >= quiet_at {
                    break;
                }
                let (guard, _) = self.cond.wait_timeout(st, quiet_at - now).unwrap();
                st = guard;
            } else {
                st = self.cond.wait(st).unwrap();
            }
        }
        st.background_in_flight += 1;
        drop(st);

        let _slot = BackgroundSlot { mgr: self };
        let token = CancelToken {
            mgr: Some(Arc::clone(self)),
            deadline: Some(Instant::now() + timeout),
        };
        f(&token)
    }
}

struct BackgroundSlot<'a> {
    mgr: &'a BackgroundTaskManager,
}

impl Drop for BackgroundSlot<'_> {
    fn drop(&mut self) {
        self.mgr.state.lock().unwrap().background_in_flight -= 1;
        self.mgr.cond.notify_all();
    }
}

/// RAII handle for a prioritized section; ending it starts the quiet window.
pub struct PriorityGuard {
    mgr: Arc<BackgroundTaskManager>,
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        self.mgr.end_priority();
    }
}

/// Cooperative cancellation handle polled at I/O boundaries.
pub struct CancelToken {
    mgr: Option<Arc<BackgroundTaskManager>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never cancels, for foreground walks and tests.
    pub fn unbounded() -> Self {
        Self {
            mgr: None,
            deadline: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        if let Some(ref mgr) = self.mgr {
            if mgr.priority_active() {
                return true;
            }
        }
        false
    }
}
