//! Single-flight refresh fed by two invalidation sources: a poll timer and
//! realtime change pings.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::MessagingResult;

type RefreshFn<T> = Arc<dyn Fn() -> BoxFuture<'static, MessagingResult<T>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This call performed the refresh (possibly more than once).
    Ran,
    /// Another refresh was in flight; it will run again on our behalf.
    Coalesced,
}

struct Inner<T> {
    task: RefreshFn<T>,
    in_flight: AtomicBool,
    rerun: AtomicBool,
    runs: AtomicU64,
    latest: watch::Sender<Option<T>>,
}

/// Releases the in-flight flag even if the refreshing future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Refresher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Refresher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Refresher<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MessagingResult<T>> + Send + 'static,
    {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                task: Arc::new(move || task().boxed()),
                in_flight: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                runs: AtomicU64::new(0),
                latest,
            }),
        }
    }

    /// Refresh now, or fold into the refresh already running.
    ///
    /// Any number of concurrent calls produce one in-flight run plus at most
    /// one follow-up run, so no request is lost and none is duplicated.
    pub async fn refresh(&self) -> RefreshOutcome {
        let inner = &self.inner;
        let Some(mut guard) = InFlight::acquire(&inner.in_flight) else {
            inner.rerun.store(true, Ordering::Release);
            return RefreshOutcome::Coalesced;
        };

        loop {
            inner.rerun.store(false, Ordering::Release);
            self.run_once().await;
            if inner.rerun.load(Ordering::Acquire) {
                continue;
            }
            drop(guard);
            // A request may have landed between the check and the release.
            if !inner.rerun.load(Ordering::Acquire) {
                break;
            }
            match InFlight::acquire(&inner.in_flight) {
                Some(next) => guard = next,
                None => break,
            }
        }
        RefreshOutcome::Ran
    }

    /// Fire-and-forget refresh, for synchronous callers such as notifier callbacks.
    pub fn trigger(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.refresh().await;
        });
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.inner.latest.subscribe()
    }

    /// Completed refresh runs, successful or not.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Acquire)
    }

    /// Refresh every `interval` until the handle is stopped or dropped.
    /// The first tick fires immediately.
    pub fn spawn_polling(&self, interval: Duration) -> PollHandle {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.refresh().await;
            }
        });
        debug!(interval_ms = interval.as_millis() as u64, "Polling started");
        PollHandle { task: Some(task) }
    }

    async fn run_once(&self) {
        let result = (self.inner.task)().await;
        self.inner.runs.fetch_add(1, Ordering::AcqRel);
        match result {
            Ok(value) => {
                self.inner.latest.send_replace(Some(value));
            }
            Err(e) => warn!(error = %e, "Refresh failed, keeping previous snapshot"),
        }
    }
}

/// Running poll timer. Dropping it stops polling.
pub struct PollHandle {
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Polling stopped");
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.abort();
    }
}
