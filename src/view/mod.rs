use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{is_cancelled, Error};
use crate::export::health::HealthMetrics;

/// One refresh pass of a periodic view.
///
/// Implementations load from upstream, transform, and write to the store.
/// Returning `Ok(())` marks the owning view as ready.
pub trait Refresh: Send + Sync + 'static {
    fn refresh(&self, cancel: &CancellationToken) -> impl Future<Output = Result<()>> + Send;
}

/// Outcome label recorded on `view_refresh_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Success,
    Error,
    Panic,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
            Status::Panic => "panic",
        }
    }
}

/// Periodically refreshed view with one-way readiness.
///
/// Refreshes never overlap; a refresh requested while another runs waits
/// for it to finish. Once a refresh succeeds the view stays ready for the
/// rest of the process lifetime.
pub struct View<R> {
    name: &'static str,
    body: R,
    interval: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
    ready: watch::Sender<bool>,
    health: Arc<HealthMetrics>,
}

impl<R: Refresh> View<R> {
    /// Creates a view that is not yet ready.
    pub fn new(name: &'static str, body: R, interval: Duration, health: Arc<HealthMetrics>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            name,
            body,
            interval,
            refresh_lock: tokio::sync::Mutex::new(()),
            ready,
            health,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The refresh body, for store access by dependants.
    pub fn body(&self) -> &R {
        &self.body
    }

    /// Whether at least one refresh has succeeded.
    pub fn ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// A cloneable handle for observing readiness without holding the view.
    pub fn readiness(&self) -> Readiness {
        Readiness {
            name: self.name,
            rx: self.ready.subscribe(),
        }
    }

    /// Blocks until ready or until `cancel` fires.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        self.readiness().wait(cancel).await
    }

    /// Runs one refresh under the view's single-flight lock.
    ///
    /// Panics inside the body are caught and reported as errors.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let start = Instant::now();
        debug!(view = self.name, "refresh started");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow::Error::new(Error::Cancelled)),
            res = AssertUnwindSafe(self.body.refresh(cancel)).catch_unwind() => match res {
                Ok(res) => res,
                Err(panic) => {
                    self.record(Status::Panic, start.elapsed());
                    error!(view = self.name, panic = %panic_message(&*panic), "refresh panicked");
                    return Err(anyhow!("{} refresh panicked: {}", self.name, panic_message(&*panic)));
                }
            },
        };

        match outcome {
            Ok(()) => {
                self.record(Status::Success, start.elapsed());
                self.mark_ready();
                Ok(())
            }
            Err(e) if is_cancelled(&e) => {
                debug!(view = self.name, "refresh cancelled");
                Err(e)
            }
            Err(e) => {
                self.record(Status::Error, start.elapsed());
                Err(e)
            }
        }
    }

    /// Spawns the refresh loop: an immediate refresh, then one per interval.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let view = Arc::clone(self);

        tokio::spawn(async move {
            info!(view = view.name, interval = ?view.interval, "starting refresh loop");

            // First tick completes immediately.
            let mut ticker = tokio::time::interval(view.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => view.safe_refresh(&cancel).await,
                }
            }
        })
    }

    async fn safe_refresh(&self, cancel: &CancellationToken) {
        if let Err(e) = self.refresh(cancel).await {
            if is_cancelled(&e) {
                return;
            }
            error!(view = self.name, error = %format!("{e:#}"), "refresh failed");
        }
    }

    fn mark_ready(&self) {
        let changed = self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
        if changed {
            info!(view = self.name, "view is now ready");
        }
    }

    fn record(&self, status: Status, elapsed: Duration) {
        self.health
            .view_refresh_total
            .with_label_values(&[self.name, status.as_str()])
            .inc();
        self.health
            .view_refresh_duration
            .with_label_values(&[self.name])
            .observe(elapsed.as_secs_f64());
        info!(
            view = self.name,
            status = status.as_str(),
            duration = ?elapsed,
            "refresh completed"
        );
    }
}

/// Read-only readiness handle for a view.
#[derive(Clone)]
pub struct Readiness {
    name: &'static str,
    rx: watch::Receiver<bool>,
}

impl Readiness {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Blocks until ready or until `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow::Error::new(Error::Cancelled)
                .context(format!("context cancelled while waiting for {} view", self.name))),
            res = rx.wait_for(|ready| *ready) => res
                .map(|_| ())
                .map_err(|_| anyhow!("{} view dropped before becoming ready", self.name)),
        }
    }

    /// Like [`Readiness::wait`], bounded by `timeout`.
    pub async fn wait_timeout(&self, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.wait(cancel)).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("{} view not ready after {:?}", self.name, timeout)),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: AtomicBool,
        panic_once: AtomicBool,
        delay_ms: u64,
    }

    struct ProbeRefresh(Arc<Probe>);

    impl Refresh for ProbeRefresh {
        async fn refresh(&self, _cancel: &CancellationToken) -> Result<()> {
            let probe = &self.0;
            probe.calls.fetch_add(1, Ordering::SeqCst);

            if probe.panic_once.swap(false, Ordering::SeqCst) {
                panic!("boom");
            }

            let now = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if probe.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(probe.delay_ms)).await;
            }
            probe.in_flight.fetch_sub(1, Ordering::SeqCst);

            if probe.fail.load(Ordering::SeqCst) {
                anyhow::bail!("upstream unavailable");
            }
            Ok(())
        }
    }

    fn view_with(probe: &Arc<Probe>, interval: Duration) -> Arc<View<ProbeRefresh>> {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        Arc::new(View::new(
            "probe",
            ProbeRefresh(Arc::clone(probe)),
            interval,
            health,
        ))
    }

    fn count(view: &View<ProbeRefresh>, status: &str) -> f64 {
        view.health
            .view_refresh_total
            .with_label_values(&["probe", status])
            .get()
    }

    #[tokio::test]
    async fn test_not_ready_until_first_success() {
        let probe = Arc::new(Probe::default());
        probe.fail.store(true, Ordering::SeqCst);
        let view = view_with(&probe, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        assert!(!view.ready());
        assert!(view.refresh(&cancel).await.is_err());
        assert!(!view.ready());
        assert_eq!(count(&view, "error"), 1.0);

        probe.fail.store(false, Ordering::SeqCst);
        view.refresh(&cancel).await.expect("should succeed");
        assert!(view.ready());
        assert_eq!(count(&view, "success"), 1.0);
    }

    #[tokio::test]
    async fn test_readiness_never_reverts() {
        let probe = Arc::new(Probe::default());
        let view = view_with(&probe, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        view.refresh(&cancel).await.expect("should succeed");
        probe.fail.store(true, Ordering::SeqCst);
        assert!(view.refresh(&cancel).await.is_err());

        assert!(view.ready());
        assert!(view.readiness().is_ready());
    }

    #[tokio::test]
    async fn test_refreshes_do_not_overlap() {
        let probe = Arc::new(Probe {
            delay_ms: 20,
            ..Default::default()
        });
        let view = view_with(&probe, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let (a, b, c) = tokio::join!(
            view.refresh(&cancel),
            view.refresh(&cancel),
            view.refresh(&cancel)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let probe = Arc::new(Probe::default());
        probe.panic_once.store(true, Ordering::SeqCst);
        let view = view_with(&probe, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let err = view.refresh(&cancel).await.expect_err("should report panic");
        assert!(err.to_string().contains("panicked"));
        assert_eq!(count(&view, "panic"), 1.0);
        assert!(!view.ready());

        view.refresh(&cancel).await.expect("next refresh runs");
        assert!(view.ready());
    }

    #[tokio::test]
    async fn test_loop_survives_panic_and_refreshes_again() {
        let probe = Arc::new(Probe::default());
        probe.panic_once.store(true, Ordering::SeqCst);
        let view = view_with(&probe, Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let handle = view.start(cancel.clone());
        view.wait_ready(&cancel).await.expect("becomes ready");
        cancel.cancel();
        handle.await.expect("loop exits");

        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(count(&view, "panic"), 1.0);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_not_counted_as_error() {
        let probe = Arc::new(Probe {
            delay_ms: 1_000,
            ..Default::default()
        });
        let view = view_with(&probe, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = view.refresh(&cancel).await.expect_err("cancelled");
        assert!(is_cancelled(&err));
        assert_eq!(count(&view, "error"), 0.0);
    }

    #[tokio::test]
    async fn test_wait_ready_cancelled() {
        let probe = Arc::new(Probe::default());
        let view = view_with(&probe, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = view.wait_ready(&cancel).await.expect_err("cancelled");
        assert!(is_cancelled(&err));
        assert!(format!("{err:#}").contains("context cancelled while waiting for probe view"));
    }

    #[tokio::test]
    async fn test_wait_timeout_elapses() {
        let probe = Arc::new(Probe::default());
        let view = view_with(&probe, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let err = view
            .readiness()
            .wait_timeout(&cancel, Duration::from_millis(10))
            .await
            .expect_err("times out");
        assert!(err.to_string().contains("not ready after"));
    }

    #[tokio::test]
    async fn test_start_refreshes_immediately() {
        let probe = Arc::new(Probe::default());
        let view = view_with(&probe, Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let handle = view.start(cancel.clone());
        tokio::time::timeout(Duration::from_secs(5), view.wait_ready(&cancel))
            .await
            .expect("first refresh should not wait for the interval")
            .expect("ready");
        cancel.cancel();
        handle.await.expect("loop exits");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
