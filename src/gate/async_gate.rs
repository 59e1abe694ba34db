//! Resettable asynchronous gate.
//!
//! An [`AsyncGate`] is a broadcast barrier: while open, [`AsyncGate::wait`]
//! returns immediately; while closed, every waiter is suspended until the next
//! [`AsyncGate::open`], which releases all of them together. The gate can be
//! toggled any number of times.
//!
//! ## State
//!
//! The whole state lives in one atomic word:
//!
//! - bit 0: open flag
//! - bits 1..: generation, advanced on every actual transition
//!
//! `open` and `close` are compare-and-exchange retry loops over that word, so
//! racing controllers never lose a transition and never need a lock. Closing
//! starts a fresh closed generation only when it observes the gate open; it
//! never "un-releases" a generation that was already opened.
//!
//! A waiter snapshots the word when it finds the gate closed. Since the only
//! transition out of a closed generation is an open, any change of the word
//! after that snapshot means the waiter's generation was released, even if a
//! racing `close` has already started the next one.
//!
//! Wake-ups go through a [`Notify`]. A waiter registers its notification
//! *before* re-checking the state, so an `open` landing between the check and
//! the await cannot be missed.
//!
//! Every access is `SeqCst`: the receive pipeline orders its in-flight counter
//! against `is_open`, and a draining controller orders `close` against that
//! counter.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

const OPEN: u64 = 1;
const GENERATION_STEP: u64 = 2;

/// Broadcast barrier that can be opened and closed repeatedly.
#[derive(Debug)]
pub struct AsyncGate {
    state: AtomicU64,
    notify: Notify,
}

impl AsyncGate {
    /// Create a gate in the given state.
    pub fn new(open: bool) -> Self {
        Self {
            state: AtomicU64::new(if open { OPEN } else { 0 }),
            notify: Notify::new(),
        }
    }

    /// Whether waiters currently pass straight through.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) & OPEN != 0
    }

    /// Open or close the gate.
    pub fn set_open(&self, open: bool) {
        if open {
            self.open();
        } else {
            self.close();
        }
    }

    /// Number of transitions the gate has gone through.
    pub fn generation(&self) -> u64 {
        self.state.load(Ordering::SeqCst) >> 1
    }

    /// Open the gate, releasing every current waiter.
    ///
    /// Returns `false` if the gate was already open.
    pub fn open(&self) -> bool {
        // ---
        if !self.transition(true) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Close the gate. Callers already past the gate are unaffected.
    ///
    /// Returns `false` if the gate was already closed.
    pub fn close(&self) -> bool {
        self.transition(false)
    }

    /// Wait until the gate is open.
    ///
    /// Resolves immediately if it is open now; otherwise suspends the calling
    /// task (not its worker thread) until the next [`open`](Self::open).
    pub async fn wait(&self) {
        // ---
        let observed = self.state.load(Ordering::SeqCst);
        if observed & OPEN != 0 {
            return;
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.load(Ordering::SeqCst) != observed {
                return;
            }

            notified.await;
        }
    }

    // CAS loop flipping the open bit and advancing the generation. Returns
    // whether this call performed the transition.
    fn transition(&self, open: bool) -> bool {
        // ---
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if (current & OPEN != 0) == open {
                return false;
            }

            let next = (current ^ OPEN).wrapping_add(GENERATION_STEP);
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AsyncGate {
    /// An open gate.
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    async fn resolves_now(gate: &AsyncGate) -> bool {
        // ---
        timeout(Duration::from_millis(1), gate.wait()).await.is_ok()
    }

    #[tokio::test]
    async fn test_open_gate_does_not_suspend() {
        // ---
        let gate = AsyncGate::new(true);
        assert!(resolves_now(&gate).await);
    }

    #[tokio::test]
    async fn test_closed_gate_waits_for_open() {
        // ---
        let gate = Arc::new(AsyncGate::new(false));
        let released = Arc::new(AtomicUsize::new(0));

        let task = {
            let gate = gate.clone();
            let released = released.clone();
            tokio::spawn(async move {
                gate.wait().await;
                released.fetch_add(1, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(SHORT).await;
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert!(gate.open());
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_and_open_are_idempotent() {
        // ---
        let gate = AsyncGate::new(true);
        assert!(!gate.open());
        assert_eq!(gate.generation(), 0);

        assert!(gate.close());
        assert!(!gate.close());
        assert!(!gate.is_open());
        assert_eq!(gate.generation(), 1);

        assert!(gate.open());
        assert!(!gate.open());
        assert!(gate.is_open());
        assert_eq!(gate.generation(), 2);
    }

    #[tokio::test]
    async fn test_set_open() {
        // ---
        let gate = AsyncGate::default();
        gate.set_open(false);
        assert!(!gate.is_open());
        gate.set_open(true);
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn test_broadcast_releases_all_waiters() {
        // ---
        const WAITERS: usize = 50;

        let gate = Arc::new(AsyncGate::new(false));
        let started = Arc::new(tokio::sync::Barrier::new(WAITERS + 1));
        let released = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::with_capacity(WAITERS);
        for _ in 0..WAITERS {
            let gate = gate.clone();
            let started = started.clone();
            let released = released.clone();
            tasks.push(tokio::spawn(async move {
                started.wait().await;
                gate.wait().await;
                released.fetch_add(1, Ordering::SeqCst);
            }));
        }

        started.wait().await;
        tokio::time::sleep(SHORT).await;
        assert_eq!(released.load(Ordering::SeqCst), 0);

        gate.open();

        for task in tasks {
            timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), WAITERS);
    }

    #[tokio::test]
    async fn test_waiter_released_by_open_even_if_closed_again() {
        // ---
        let gate = Arc::new(AsyncGate::new(false));

        let task = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(SHORT).await;

        gate.open();
        gate.close();

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn test_open_close_sequences() {
        // ---
        // Small LCG so the sequence is reproducible.
        let mut seed: u32 = 0x5eed;
        let mut next = move || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 16) & 1 == 1
        };

        let gate = Arc::new(AsyncGate::new(true));
        for _ in 0..200 {
            let was_open = gate.is_open();
            if next() {
                assert_eq!(gate.open(), !was_open);
            } else {
                assert_eq!(gate.close(), was_open);
            }

            if gate.is_open() {
                assert!(resolves_now(&gate).await);
            } else {
                let waiter = {
                    let gate = gate.clone();
                    tokio::spawn(async move { gate.wait().await })
                };
                tokio::task::yield_now().await;
                assert!(!waiter.is_finished());
                gate.open();
                timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_controllers_keep_state_consistent() {
        // ---
        let gate = Arc::new(AsyncGate::new(true));

        let togglers: Vec<_> = (0..4)
            .map(|i| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    for n in 0..1_000 {
                        gate.set_open((n + i) % 2 == 0);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for t in togglers {
            t.await.unwrap();
        }

        // Every transition advanced the generation exactly once, so its parity
        // tracks the open bit (starting open at generation 0).
        assert_eq!(gate.generation() % 2 == 0, gate.is_open());

        gate.open();
        assert!(resolves_now(&gate).await);
    }
}
