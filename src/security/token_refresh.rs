use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::client::ClientError;
use crate::transport::BearerToken;

type Outcome = Option<Result<BearerToken, ClientError>>;
type Pending = HashMap<String, watch::Receiver<Outcome>>;

/// In-flight bearer refreshes keyed by bearer identifier.
///
/// The first caller for an identifier starts the refresh as a task owned by
/// the table; every caller, the first included, only waits on it. Dropping a
/// caller drops its wait and nothing else. Waits and the refresh itself are
/// bounded by `wait`.
#[derive(Debug, Clone)]
pub struct BearerRefresher {
    wait: Duration,
    pending: Arc<Mutex<Pending>>,
}

// Removes the entry when the refresh task finishes or panics.
struct PendingGuard {
    pending: Arc<Mutex<Pending>>,
    bearer_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.bearer_id);
    }
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    match pending.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

fn unavailable(bearer_id: &str, reason: &str) -> ClientError {
    ClientError::BearerUnavailable {
        bearer_id: bearer_id.to_string(),
        reason: reason.to_string(),
    }
}

impl BearerRefresher {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Joins the refresh in flight for `bearer_id`, starting `refresh` if
    /// there is none.
    pub async fn obtain<F, Fut>(&self, bearer_id: &str, refresh: F) -> Result<BearerToken, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BearerToken, ClientError>> + Send + 'static,
    {
        let rx = {
            let mut pending = lock(&self.pending);
            match pending.get(bearer_id) {
                Some(rx) => {
                    debug!(bearer_id = %bearer_id, "joining in-flight bearer refresh");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(bearer_id.to_string(), rx.clone());
                    self.spawn_refresh(bearer_id, tx, refresh());
                    rx
                }
            }
        };
        self.follow(bearer_id, rx).await
    }

    fn spawn_refresh<Fut>(&self, bearer_id: &str, tx: watch::Sender<Outcome>, refresh: Fut)
    where
        Fut: Future<Output = Result<BearerToken, ClientError>> + Send + 'static,
    {
        info!(bearer_id = %bearer_id, "refreshing bearer");
        let guard = PendingGuard {
            pending: self.pending.clone(),
            bearer_id: bearer_id.to_string(),
        };
        let wait = self.wait;
        tokio::spawn(async move {
            let outcome = match timeout(wait, refresh).await {
                Ok(outcome) => outcome,
                Err(_) => Err(unavailable(&guard.bearer_id, "refresh timed out")),
            };
            // unregister before publishing so later callers start afresh
            drop(guard);
            // every waiter may have given up already
            let _ = tx.send(Some(outcome));
        });
    }

    async fn follow(
        &self,
        bearer_id: &str,
        mut rx: watch::Receiver<Outcome>,
    ) -> Result<BearerToken, ClientError> {
        match timeout(self.wait, rx.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => (*outcome)
                .clone()
                .unwrap_or_else(|| Err(unavailable(bearer_id, "refresh abandoned"))),
            // refresh task panicked before publishing
            Ok(Err(_)) => Err(unavailable(bearer_id, "refresh abandoned")),
            Err(_) => Err(unavailable(bearer_id, "timed out waiting for refresh")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Refresh = Pin<Box<dyn Future<Output = Result<BearerToken, ClientError>> + Send>>;

    fn token(id: &str, access: &str) -> BearerToken {
        BearerToken {
            id: id.into(),
            credential: None,
            access: access.into(),
            exp: None,
        }
    }

    // A refresh that counts its runs, sleeps, then yields `outcome`.
    fn counted(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        outcome: Result<BearerToken, ClientError>,
    ) -> impl FnOnce() -> Refresh {
        let calls = calls.clone();
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                outcome
            })
        }
    }

    async fn settle(refresher: &BearerRefresher) {
        while refresher.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let refresher = BearerRefresher::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(50);
        let fresh = Ok(token("core", "fresh"));

        let (a, b, c) = tokio::join!(
            refresher.obtain("core", counted(&calls, delay, fresh.clone())),
            refresher.obtain("core", counted(&calls, delay, fresh.clone())),
            refresher.obtain("core", counted(&calls, delay, fresh.clone())),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().access, "fresh");
        assert_eq!(b.unwrap().access, "fresh");
        assert_eq!(c.unwrap().access, "fresh");
        assert_eq!(refresher.in_flight(), 0);
    }

    #[tokio::test]
    async fn failure_reaches_every_joined_caller() {
        let refresher = BearerRefresher::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(20);
        let rejected = Err(unavailable("core", "login rejected"));

        let (a, b) = tokio::join!(
            refresher.obtain("core", counted(&calls, delay, rejected.clone())),
            refresher.obtain("core", counted(&calls, delay, rejected.clone())),
        );

        let expected = unavailable("core", "login rejected");
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
    }

    #[tokio::test]
    async fn identifiers_refresh_independently() {
        let refresher = BearerRefresher::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(20);

        let (a, b) = tokio::join!(
            refresher.obtain("core", counted(&calls, delay, Err(unavailable("core", "down")))),
            refresher.obtain("billing", counted(&calls, delay, Ok(token("billing", "ok")))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(a.is_err());
        assert_eq!(b.unwrap().access, "ok");
    }

    #[tokio::test]
    async fn hung_refresh_is_bounded() {
        let refresher = BearerRefresher::new(Duration::from_millis(50));
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_secs(10);
        let late = Ok(token("core", "late"));

        let (a, b) = tokio::join!(
            refresher.obtain("core", counted(&calls, delay, late.clone())),
            refresher.obtain("core", counted(&calls, delay, late.clone())),
        );

        assert!(matches!(a, Err(ClientError::BearerUnavailable { .. })));
        assert!(matches!(b, Err(ClientError::BearerUnavailable { .. })));
        settle(&refresher).await;
        assert_eq!(refresher.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_first_caller_does_not_cancel_refresh() {
        let refresher = BearerRefresher::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(100);

        let first = {
            let refresher = refresher.clone();
            let refresh = counted(&calls, delay, Ok(token("core", "fresh")));
            tokio::spawn(async move { refresher.obtain("core", refresh).await })
        };
        while refresher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let second = {
            let refresher = refresher.clone();
            let refresh = counted(&calls, delay, Ok(token("core", "unused")));
            tokio::spawn(async move { refresher.obtain("core", refresh).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        let result = second.await.unwrap();
        assert_eq!(result, Ok(token("core", "fresh")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.in_flight(), 0);
    }

    #[tokio::test]
    async fn refresh_completes_with_no_one_waiting() {
        let refresher = BearerRefresher::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let refresh = counted(&calls, Duration::from_millis(30), Ok(token("core", "fresh")));

        let caller = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.obtain("core", refresh).await })
        };
        while refresher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        caller.abort();

        settle(&refresher).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    async fn crashing_login() -> Result<BearerToken, ClientError> {
        panic!("login handler crashed")
    }

    #[tokio::test]
    async fn panicking_refresh_is_abandoned() {
        let refresher = BearerRefresher::new(Duration::from_secs(5));
        let result = refresher.obtain("core", crashing_login).await;

        assert_eq!(result, Err(unavailable("core", "refresh abandoned")));
        assert_eq!(refresher.in_flight(), 0);
    }

    #[tokio::test]
    async fn completed_refresh_is_not_reused() {
        let refresher = BearerRefresher::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let fresh = Ok(token("core", "fresh"));

        refresher
            .obtain("core", counted(&calls, Duration::ZERO, fresh.clone()))
            .await
            .unwrap();
        refresher
            .obtain("core", counted(&calls, Duration::ZERO, fresh.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
