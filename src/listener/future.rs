//! Completion handle for an asynchronous bind.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::BindError;

pub type BindOutcome = Result<SocketAddr, BindError>;

/// Create a connected completion sender and handle.
pub(crate) fn completion() -> (Completion, ServerConnectorFuture) {
    let (tx, rx) = watch::channel(None);
    (Completion { tx }, ServerConnectorFuture { rx })
}

/// Resolving side, owned by the bind task.
#[derive(Debug)]
pub(crate) struct Completion {
    tx: watch::Sender<Option<BindOutcome>>,
}

impl Completion {
    /// Resolve the handle. Only the first call has any effect.
    pub(crate) fn complete(&self, outcome: BindOutcome) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }
}

/// Observable outcome of `start()`: bound with the local address, or failed with a cause.
///
/// Clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct ServerConnectorFuture {
    rx: watch::Receiver<Option<BindOutcome>>,
}

impl ServerConnectorFuture {
    /// Wait for the bind to resolve.
    ///
    /// Resolves to [`BindError::Aborted`] if the bind task went away without an outcome.
    pub async fn wait(&self) -> BindOutcome {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(BindError::Aborted)),
            Err(_) => Err(BindError::Aborted),
        };
        outcome
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<BindOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// The outcome, if already resolved.
    pub fn outcome(&self) -> Option<BindOutcome> {
        (*self.rx.borrow()).clone()
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(*self.rx.borrow(), Some(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let (completion, future) = completion();
        assert!(!future.is_done());

        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert!(completion.complete(Ok(addr)));
        assert!(!completion.complete(Err(BindError::Aborted)));

        assert_eq!(future.wait().await, Ok(addr));
        assert_eq!(future.clone().outcome(), Some(Ok(addr)));
        assert!(future.is_success());
    }

    #[tokio::test]
    async fn outcome_survives_sender_drop() {
        let (completion, future) = completion();
        completion.complete(Err(BindError::Io("boom".into())));
        drop(completion);
        assert_eq!(future.wait().await, Err(BindError::Io("boom".into())));
    }

    #[tokio::test]
    async fn dropped_sender_aborts_waiters() {
        let (completion, future) = completion();
        let waiter = tokio::spawn({
            let future = future.clone();
            async move { future.wait().await }
        });
        drop(completion);
        assert_eq!(waiter.await.unwrap(), Err(BindError::Aborted));
    }

    #[tokio::test]
    async fn parked_waiters_wake_on_completion() {
        let (completion, future) = completion();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let future = future.clone();
                tokio::spawn(async move { future.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;

        let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        completion.complete(Ok(addr));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(addr));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_gives_up() {
        let (_completion, future) = completion();
        assert!(future.wait_timeout(Duration::from_secs(1)).await.is_none());
    }
}
