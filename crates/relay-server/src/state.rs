use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relay::Executor;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// Admission counter gating the whole process. One logical request is in
/// flight at a time by default; excess requests are rejected immediately
/// instead of queued.
pub struct Admission {
    current: AtomicUsize,
    limit: usize,
}

impl Admission {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Admission {
            current: AtomicUsize::new(0),
            limit,
        })
    }

    /// Take a slot, or `None` when the ceiling is reached. The returned
    /// permit releases the slot on drop, whatever happens to the request.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let acquired = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.limit).then_some(current + 1)
            });
        acquired.ok().map(|_| AdmissionPermit {
            admission: self.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

pub struct AdmissionPermit {
    admission: Arc<Admission>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.admission.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct AppState {
    pub executor: Arc<dyn Executor>,
    pub admission: Arc<Admission>,
    pub metrics: Arc<Metrics>,
    pub shutdown: CancellationToken,
    /// Verbose mode: failure detail is appended to the client-visible
    /// error delta instead of staying server-side only.
    pub debug: bool,
}

impl AppState {
    pub fn new(executor: Arc<dyn Executor>, concurrent_req_limit: usize, debug: bool) -> Arc<Self> {
        Arc::new(AppState {
            executor,
            admission: Admission::new(concurrent_req_limit),
            metrics: Arc::new(Metrics::default()),
            shutdown: CancellationToken::new(),
            debug,
        })
    }
}
