// Sequential timer used for every retransmission and give-up decision in a transfer.
//
// A `SequentialCall` runs an action after each delay of a caller-supplied schedule. Once the
// schedule runs dry the exhaustion hook fires exactly once and the instance is spent. Nothing
// here spawns a task: the owner awaits `SequentialCall::tick` from its own event loop, so the
// action always runs on the task that owns the session state.
//
// Timing comes from `tokio::time`, which tests pause and advance by hand.

use std::error;
use std::fmt;
use std::future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// Why a [`SequentialCall`] refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// The delay schedule ran out; the instance has already fired its exhaustion hook.
    AlreadySpent,
    /// Somebody called [`SequentialCall::cancel`] earlier.
    AlreadyCancelled,
    /// [`SequentialCall::start`] was called twice.
    AlreadyStarted,
}

impl error::Error for ScheduleError {}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScheduleError::AlreadySpent => f.write_str("sequential call already spent"),
            ScheduleError::AlreadyCancelled => f.write_str("sequential call already cancelled"),
            ScheduleError::AlreadyStarted => f.write_str("sequential call already started"),
        }
    }
}

/// Something that happened on a [`SequentialCall`].
#[derive(Debug, PartialEq, Eq)]
pub enum Tick<T> {
    /// A delay elapsed and the action ran, producing this value.
    Fired(T),
    /// The schedule is exhausted. Carries the exhaustion hook's value, if a hook was set.
    Exhausted(Option<T>),
}

/// Runs `action` after each delay produced by the schedule until it is exhausted or cancelled.
pub struct SequentialCall<T> {
    delays: Box<dyn Iterator<Item = Duration> + Send>,
    action: Box<dyn FnMut() -> T + Send>,
    on_exhausted: Option<Box<dyn FnOnce() -> T + Send>>,
    timer: Option<Pin<Box<Sleep>>>,
    /// Exhaustion that happened but hasn't been reported through `tick` yet.
    unreported: Option<Option<T>>,
    started: bool,
    spent: bool,
    cancelled: bool,
}

impl<T> SequentialCall<T> {
    /// Builds an idle instance. Nothing is scheduled until [`SequentialCall::start`].
    pub fn new<I, F>(delays: I, action: F) -> SequentialCall<T>
    where
        I: IntoIterator<Item = Duration>,
        I::IntoIter: Send + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        SequentialCall {
            delays: Box::new(delays.into_iter()),
            action: Box::new(action),
            on_exhausted: None,
            timer: None,
            unreported: None,
            started: false,
            spent: false,
            cancelled: false,
        }
    }

    /// Sets the hook run once when the schedule runs out.
    pub fn on_exhausted<F>(mut self, hook: F) -> SequentialCall<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.on_exhausted = Some(Box::new(hook));
        self
    }

    /// Arms the first delay. With `run_now` the action is also invoked immediately and its value
    /// returned, which is how a datagram gets its first transmission.
    pub fn start(&mut self, run_now: bool) -> Result<Option<T>, ScheduleError> {
        self.check_live()?;
        if self.started {
            return Err(ScheduleError::AlreadyStarted);
        }
        self.started = true;
        let immediate = run_now.then(|| (self.action)());
        self.schedule_next();
        Ok(immediate)
    }

    /// Stops any pending timer. Fails if the instance is already spent or cancelled.
    pub fn cancel(&mut self) -> Result<(), ScheduleError> {
        self.check_live()?;
        self.cancelled = true;
        self.timer = None;
        self.unreported = None;
        Ok(())
    }

    /// Whether this instance can still fire.
    pub fn active(&self) -> bool {
        !self.spent && !self.cancelled
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// When the armed timer is due, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.as_ref().map(|timer| timer.deadline())
    }

    /// Waits for the next thing to happen.
    ///
    /// Cancel safe: dropping the future leaves the armed timer untouched, so this can sit in a
    /// `select!` next to socket reads. An instance with nothing left to report never resolves.
    pub async fn tick(&mut self) -> Tick<T> {
        if let Some(result) = self.unreported.take() {
            return Tick::Exhausted(result);
        }
        match self.timer.as_mut() {
            Some(timer) => timer.as_mut().await,
            None => future::pending::<()>().await,
        }
        self.timer = None;
        let fired = (self.action)();
        self.schedule_next();
        Tick::Fired(fired)
    }

    fn check_live(&self) -> Result<(), ScheduleError> {
        if self.cancelled {
            Err(ScheduleError::AlreadyCancelled)
        } else if self.spent {
            Err(ScheduleError::AlreadySpent)
        } else {
            Ok(())
        }
    }

    fn schedule_next(&mut self) {
        match self.delays.next() {
            Some(delay) => self.timer = Some(Box::pin(sleep(delay))),
            None => {
                self.spent = true;
                self.unreported = Some(self.on_exhausted.take().map(|hook| hook()));
            }
        }
    }
}

impl<T> fmt::Debug for SequentialCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SequentialCall")
            .field("deadline", &self.deadline())
            .field("started", &self.started)
            .field("spent", &self.spent)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn secs(list: &[u64]) -> Vec<Duration> {
        list.iter().copied().map(Duration::from_secs).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_on_schedule_then_exhausts_once() {
        let exhausted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exhausted);
        let begin = Instant::now();
        let mut call = SequentialCall::new(secs(&[1, 1, 1]), move || begin.elapsed().as_secs())
            .on_exhausted(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                0
            });

        assert_eq!(call.start(false), Ok(None));
        let mut fired = Vec::new();
        loop {
            match call.tick().await {
                Tick::Fired(offset) => fired.push(offset),
                Tick::Exhausted(result) => {
                    assert_eq!(result, Some(0));
                    break;
                }
            }
        }

        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert!(call.is_spent());
        assert!(!call.active());
        assert_eq!(call.cancel(), Err(ScheduleError::AlreadySpent));
        assert_eq!(call.start(true), Err(ScheduleError::AlreadySpent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_invokes_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut call = SequentialCall::new(secs(&[2]), move || counter.fetch_add(1, Ordering::SeqCst));

        assert_eq!(call.start(true), Ok(Some(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(call.deadline(), Some(Instant::now() + Duration::from_secs(2)));
        assert_eq!(call.start(true), Err(ScheduleError::AlreadyStarted));

        assert_eq!(call.tick().await, Tick::Fired(1));
        assert_eq!(call.tick().await, Tick::Exhausted(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_twice_is_distinguishable() {
        let mut call = SequentialCall::new(secs(&[1, 1, 1]), || ());
        call.start(false).unwrap();
        assert!(call.active());

        assert_eq!(call.cancel(), Ok(()));
        assert!(!call.active());
        assert!(call.is_cancelled());
        assert_eq!(call.deadline(), None);
        assert_eq!(call.cancel(), Err(ScheduleError::AlreadyCancelled));
        assert_eq!(call.start(false), Err(ScheduleError::AlreadyCancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_never_fires() {
        let mut call = SequentialCall::new(secs(&[1]), || ());
        call.start(false).unwrap();
        call.cancel().unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(10), call.tick()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_tick_keeps_timer() {
        let mut call = SequentialCall::new(secs(&[5]), || "fired");
        call.start(false).unwrap();
        let deadline = call.deadline();

        // Give up on the tick half way through, as a select! losing to a datagram would.
        let early = tokio::time::timeout(Duration::from_secs(2), call.tick()).await;
        assert!(early.is_err());
        assert_eq!(call.deadline(), deadline);

        assert_eq!(call.tick().await, Tick::Fired("fired"));
        assert!(Instant::now() >= deadline.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_schedule_exhausts_immediately() {
        let mut call = SequentialCall::new(Vec::<Duration>::new(), || 1).on_exhausted(|| 2);
        assert_eq!(call.start(true), Ok(Some(1)));
        assert!(call.is_spent());
        assert_eq!(call.tick().await, Tick::Exhausted(Some(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_schedule() {
        let mut call = SequentialCall::new(std::iter::repeat(Duration::from_millis(100)), || ());
        call.start(false).unwrap();
        for _ in 0..50 {
            assert_eq!(call.tick().await, Tick::Fired(()));
        }
        assert!(call.active());
    }
}
