/// Typed, awaitable events derived from the server's free-text stdout.
///
/// The server gives no acknowledgement for console commands; the only way to
/// know that e.g. a backup actually ran is to observe its progress lines.
/// [`LogWatcher::watch`] turns that into a future with two independent
/// deadlines: one for the operation to begin and one for it to finish once it
/// has begun.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::error::WatchError;
use crate::log_bus::LogBus;
use crate::message::{parse_message, Channel, ParsedMessage};
use crate::subscription::{lock, Subscription, SubscriptionGuard};

/// How long after subscribing the start marker may take to appear.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);
/// How long after the start marker the end marker may take to appear.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Exact channel + text a parsed line must carry to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPattern {
    pub channel: Channel,
    pub text: String,
}

impl LogPattern {
    pub fn new(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: text.into(),
        }
    }

    pub fn is_match(&self, message: &ParsedMessage) -> bool {
        message.channel == self.channel && message.text == self.text
    }

    /// Parses `line` and checks it against this pattern.
    pub fn matches(&self, line: &str) -> bool {
        parse_message(line).is_some_and(|message| self.is_match(&message))
    }
}

/// Markers of a two-phase operation.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub start: LogPattern,
    pub end: LogPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchPhase {
    AwaitingStart,
    AwaitingFinish,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Started,
    Finished,
}

#[derive(Clone)]
pub struct LogWatcher {
    bus: LogBus,
    start_timeout: Duration,
    finish_timeout: Duration,
}

impl LogWatcher {
    pub fn new(bus: LogBus) -> Self {
        Self::with_timeouts(bus, START_TIMEOUT, FINISH_TIMEOUT)
    }

    pub fn with_timeouts(bus: LogBus, start_timeout: Duration, finish_timeout: Duration) -> Self {
        Self {
            bus,
            start_timeout,
            finish_timeout,
        }
    }

    pub fn bus(&self) -> &LogBus {
        &self.bus
    }

    /// Subscribes, runs `trigger`, then waits for the operation's markers.
    ///
    /// - `Err(StartTimeout)` if no start line arrives within the start timeout
    ///   (measured from subscribing).
    /// - `Err(FinishTimeout)` if the start line arrived but no end line followed
    ///   within the finish timeout (measured from the first start line).
    /// - `Ok(())` as soon as an end line arrives, whether or not a start line
    ///   was seen first.
    ///
    /// The subscription is released on every exit, including when the returned
    /// future is dropped.
    pub async fn watch<T>(&self, spec: WatchSpec, trigger: T) -> Result<(), WatchError>
    where
        T: FnOnce(),
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let WatchSpec { start, end } = spec;

        let mut deadline = Instant::now() + self.start_timeout;
        let _subscription = SubscriptionGuard::new(self.bus.subscribe(move |line| {
            let Some(message) = parse_message(line) else {
                return;
            };
            if start.is_match(&message) {
                let _ = tx.send(Signal::Started);
            }
            if end.is_match(&message) {
                let _ = tx.send(Signal::Finished);
            }
        }));

        trigger();

        let mut phase = WatchPhase::AwaitingStart;
        loop {
            tokio::select! {
                Some(signal) = rx.recv() => match signal {
                    Signal::Finished => return Ok(()),
                    // Later start lines do not extend the first finish deadline.
                    Signal::Started if phase == WatchPhase::AwaitingStart => {
                        phase = WatchPhase::AwaitingFinish;
                        deadline = Instant::now() + self.finish_timeout;
                    }
                    Signal::Started => {}
                },
                _ = sleep_until(deadline) => {
                    return Err(match phase {
                        WatchPhase::AwaitingStart => WatchError::StartTimeout,
                        WatchPhase::AwaitingFinish => WatchError::FinishTimeout,
                    });
                }
            }
        }
    }

    /// Runs `callback` for every line matching `pattern` until unsubscribed.
    pub fn permanent_watch<F>(&self, pattern: LogPattern, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.bus.subscribe(move |line| {
            if pattern.matches(line) {
                callback();
            }
        })
    }

    /// Runs `callback` for the first line matching `pattern`, then unsubscribes
    /// itself.  The returned handle can cancel it before it fires.
    pub fn once<F>(&self, pattern: LogPattern, callback: F) -> Subscription
    where
        F: FnOnce() + Send + 'static,
    {
        let callback = Mutex::new(Some(callback));
        let fired = Arc::new(AtomicBool::new(false));
        let own: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        let subscription = {
            let fired = Arc::clone(&fired);
            let own = Arc::clone(&own);
            self.bus.subscribe(move |line| {
                if !pattern.matches(line) || fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(callback) = lock(&callback).take() {
                    callback();
                }
                if let Some(own) = own.get() {
                    own.remove();
                }
            })
        };

        let _ = own.set(subscription.handle());
        // A match may have landed before the handle was stored.
        if fired.load(Ordering::SeqCst) {
            subscription.remove();
        }
        subscription
    }
}
