//! Network connectivity observation.
//!
//! A [`ConnectivityMonitor`] turns a raw platform signal into a stream of
//! deduplicated [`ConnectivityState`] transitions. Every delivery carries a
//! monotonically increasing transition counter which the sync engine uses as
//! its epoch for discarding stale asynchronous results.

use crate::config::ProbeConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Connectivity as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub connected: bool,
    /// Number of deliveries made to this subscription, starting at 1.
    pub transition: u64,
}

/// Source of the raw "is the network up" signal.
pub trait NetworkSignal: Send + Sync {
    /// A receiver of the current value, or `None` if the platform cannot
    /// report connectivity at all.
    fn watch(&self) -> Option<watch::Receiver<bool>>;
}

/// Signal driven explicitly by the embedding application (or tests).
#[derive(Debug)]
pub struct ManualSignal {
    tx: watch::Sender<bool>,
}

impl ManualSignal {
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self { tx }
    }

    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }
}

impl NetworkSignal for ManualSignal {
    fn watch(&self) -> Option<watch::Receiver<bool>> {
        Some(self.tx.subscribe())
    }
}

/// Signal for platforms without a connectivity API.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSignal;

impl NetworkSignal for UnavailableSignal {
    fn watch(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// Signal derived from periodic TCP connects to a known endpoint.
pub struct ProbeSignal {
    tx: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ProbeSignal {
    /// Start probing. Must be called from within a Tokio runtime.
    ///
    /// The signal reads as connected until the first probe completes.
    pub fn spawn(config: ProbeConfig) -> Self {
        let (tx, _) = watch::channel(true);
        let tx = Arc::new(tx);
        let task_tx = tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            loop {
                ticker.tick().await;
                let reachable = probe_once(&config.address, config.timeout()).await;
                let changed = task_tx.send_if_modified(|current| {
                    if *current == reachable {
                        false
                    } else {
                        *current = reachable;
                        true
                    }
                });
                if changed {
                    debug!("Probe of {} now reports reachable={}", config.address, reachable);
                }
            }
        });

        Self { tx, task }
    }
}

impl NetworkSignal for ProbeSignal {
    fn watch(&self) -> Option<watch::Receiver<bool>> {
        Some(self.tx.subscribe())
    }
}

impl Drop for ProbeSignal {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Attempt a single TCP connect, bounded by `timeout`.
pub async fn probe_once(address: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// Observes a [`NetworkSignal`] and hands out deduplicated subscriptions.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    signal: Arc<dyn NetworkSignal>,
    debounce: Duration,
}

impl ConnectivityMonitor {
    pub fn new(signal: Arc<dyn NetworkSignal>) -> Self {
        Self {
            signal,
            debounce: Duration::ZERO,
        }
    }

    /// Require a new value to hold for `debounce` before it is delivered.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Current known state; optimistic when the signal is unavailable.
    pub fn is_connected(&self) -> bool {
        self.signal.watch().map(|rx| *rx.borrow()).unwrap_or(true)
    }

    /// Subscribe to transitions. The first call to
    /// [`ConnectivitySubscription::next`] yields the current state.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let rx = self.signal.watch();
        if rx.is_none() {
            info!("Connectivity signal unavailable, assuming connected");
        }
        ConnectivitySubscription {
            rx,
            active: true,
            last: None,
            transition: 0,
            debounce: self.debounce,
            pending: None,
        }
    }
}

/// A live subscription to connectivity transitions.
///
/// Consecutive deliveries never carry the same `connected` value.
/// [`next`](Self::next) is cancel safe: a value waiting out the debounce
/// keeps its deadline when the future is dropped and polled again.
pub struct ConnectivitySubscription {
    rx: Option<watch::Receiver<bool>>,
    active: bool,
    last: Option<bool>,
    transition: u64,
    debounce: Duration,
    /// Undelivered value and the instant it counts as settled.
    pending: Option<(bool, Instant)>,
}

impl ConnectivitySubscription {
    /// Wait for the next delivery.
    ///
    /// Returns `None` once unsubscribed or when the signal source is gone.
    pub async fn next(&mut self) -> Option<ConnectivityState> {
        if !self.active {
            return None;
        }

        if self.rx.is_none() {
            if self.last.is_none() {
                return Some(self.deliver(true));
            }
            // No platform signal: the optimistic state never changes.
            return std::future::pending().await;
        }

        let debounce = self.debounce;
        let last = self.last;
        let rx = self.rx.as_mut()?;

        if last.is_none() {
            let connected = *rx.borrow_and_update();
            return Some(self.deliver(connected));
        }

        loop {
            let rx = self.rx.as_mut()?;
            // A change seen since the last poll restarts the window.
            if rx.has_changed().unwrap_or(false) {
                self.pending = None;
            }
            let current = *rx.borrow_and_update();

            if Some(current) == last {
                self.pending = None;
                if rx.changed().await.is_err() {
                    return self.closed();
                }
                continue;
            }

            if debounce.is_zero() {
                return Some(self.deliver(current));
            }

            let deadline = match self.pending {
                Some((value, deadline)) if value == current => deadline,
                _ => {
                    let deadline = Instant::now() + debounce;
                    self.pending = Some((current, deadline));
                    deadline
                }
            };

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.closed();
                    }
                    // Flapped inside the window; look again.
                    self.pending = None;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Some(self.deliver(current));
                }
            }
        }
    }

    fn closed(&mut self) -> Option<ConnectivityState> {
        debug!("Connectivity signal closed");
        self.active = false;
        self.rx = None;
        self.pending = None;
        None
    }

    /// Stop receiving deliveries. Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.active {
            self.active = false;
            self.rx = None;
            self.pending = None;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The last delivered state, if any.
    pub fn last(&self) -> Option<ConnectivityState> {
        self.last.map(|connected| ConnectivityState {
            connected,
            transition: self.transition,
        })
    }

    fn deliver(&mut self, connected: bool) -> ConnectivityState {
        self.pending = None;
        self.last = Some(connected);
        self.transition += 1;
        ConnectivityState {
            connected,
            transition: self.transition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(1);

    fn monitor(signal: &Arc<ManualSignal>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(signal.clone() as Arc<dyn NetworkSignal>)
    }

    #[tokio::test]
    async fn test_initial_state_is_delivered_immediately() {
        let signal = Arc::new(ManualSignal::new(false));
        let mut sub = monitor(&signal).subscribe();

        let state = sub.next().await.unwrap();
        assert!(!state.connected);
        assert_eq!(state.transition, 1);
    }

    #[tokio::test]
    async fn test_transitions_are_deduplicated() {
        let signal = Arc::new(ManualSignal::new(true));
        let mut sub = monitor(&signal).subscribe();
        assert!(sub.next().await.unwrap().connected);

        signal.set_connected(true);
        signal.set_connected(false);
        let state = sub.next().await.unwrap();
        assert!(!state.connected);
        assert_eq!(state.transition, 2);

        signal.set_connected(false);
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.next())
            .await
            .is_err());

        signal.set_connected(true);
        let state = sub.next().await.unwrap();
        assert!(state.connected);
        assert_eq!(state.transition, 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let signal = Arc::new(ManualSignal::new(true));
        let mut sub = monitor(&signal).subscribe();
        sub.next().await.unwrap();

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());

        signal.set_connected(false);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_signal_is_optimistic() {
        let monitor = ConnectivityMonitor::new(Arc::new(UnavailableSignal));
        assert!(monitor.is_connected());

        let mut sub = monitor.subscribe();
        assert!(sub.next().await.unwrap().connected);
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dropped_signal_ends_subscription() {
        let signal = Arc::new(ManualSignal::new(true));
        let mut sub = monitor(&signal).subscribe();
        sub.next().await.unwrap();

        drop(signal);
        let ended = tokio::time::timeout(WAIT, sub.next()).await.unwrap();
        assert!(ended.is_none());
        assert!(!sub.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_swallows_flaps() {
        let signal = Arc::new(ManualSignal::new(true));
        let mut sub = monitor(&signal)
            .with_debounce(Duration::from_millis(100))
            .subscribe();
        sub.next().await.unwrap();

        signal.set_connected(false);
        let flapper = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flapper.set_connected(true);
        });

        assert!(tokio::time::timeout(WAIT, sub.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_delivers_settled_value() {
        let signal = Arc::new(ManualSignal::new(true));
        let mut sub = monitor(&signal)
            .with_debounce(Duration::from_millis(100))
            .subscribe();
        sub.next().await.unwrap();

        signal.set_connected(false);
        let state = tokio::time::timeout(WAIT, sub.next()).await.unwrap().unwrap();
        assert!(!state.connected);
        assert_eq!(sub.last(), Some(state));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_survives_repolling() {
        let signal = Arc::new(ManualSignal::new(true));
        let mut sub = monitor(&signal)
            .with_debounce(Duration::from_millis(100))
            .subscribe();
        sub.next().await.unwrap();

        signal.set_connected(false);
        // Each attempt is shorter than the window and drops the future.
        let mut delivered = None;
        for _ in 0..10 {
            if let Ok(state) = tokio::time::timeout(Duration::from_millis(30), sub.next()).await {
                delivered = state;
                break;
            }
        }

        let state = delivered.expect("debounced value was never delivered");
        assert!(!state.connected);
        assert_eq!(state.transition, 2);
    }

    #[tokio::test]
    async fn test_probe_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        assert!(probe_once(&address, WAIT).await);

        drop(listener);
        assert!(!probe_once(&address, WAIT).await);
    }
}
