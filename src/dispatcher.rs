//! Credit batch dispatcher.
//!
//! Sequences credit sends over a single middleware session. The middleware
//! holds one serial connection and has no session identifier, so the
//! open -> sends -> close region is a critical section: batches from
//! different callers are serialized behind an async mutex.
//!
//! **Rules:**
//! - Sends are issued sequentially in input order.
//! - A failed send never aborts the remaining sends (continue-on-error).
//! - If open succeeded, close is attempted exactly once on every exit path.
//! - A close failure never changes the outcome of a send.
//! - An abandoned session keeps the lock until its deferred close has run.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::gateway::{CreditTarget, DeviceGateway};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of a single credit send.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub target: CreditTarget,
    /// Human label of what was sent (drink or ingredient name).
    pub label: String,
    pub success: bool,
    pub message: String,
    /// Raw middleware response, empty when nothing was received.
    pub response: String,
}

impl ItemOutcome {
    fn failed(credit: LabeledCredit, message: String) -> Self {
        Self {
            target: credit.target,
            label: credit.label,
            success: false,
            message,
            response: String::new(),
        }
    }
}

/// Aggregate outcome of a batch. `success` iff every item succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub total: usize,
    pub success_count: usize,
    pub message: String,
    pub items: Vec<ItemOutcome>,
}

impl BatchResult {
    /// Every credit failed with the same message, nothing was sent.
    fn failed(credits: Vec<LabeledCredit>, message: String) -> Self {
        let items: Vec<ItemOutcome> = credits
            .into_iter()
            .map(|c| ItemOutcome::failed(c, message.clone()))
            .collect();
        Self {
            success: false,
            total: items.len(),
            success_count: 0,
            message,
            items,
        }
    }

    /// Neither all nor nothing.
    pub fn is_partial(&self) -> bool {
        self.success_count > 0 && self.success_count < self.total
    }
}

/// A credit to send together with its display label.
#[derive(Debug, Clone)]
pub struct LabeledCredit {
    pub target: CreditTarget,
    pub label: String,
}

impl LabeledCredit {
    pub fn new(target: CreditTarget, label: impl Into<String>) -> Self {
        Self {
            target,
            label: label.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session guard
// ---------------------------------------------------------------------------

/// An open middleware session. Holding it keeps the dispatcher's critical
/// section locked. Call [`GatewaySession::close`]; if the guard is dropped
/// without it (panic, cancelled future) a close is scheduled on the runtime
/// and the lock travels with it, so no other session opens before that
/// disconnect has run.
struct GatewaySession {
    gateway: Arc<dyn DeviceGateway>,
    lock: Option<OwnedMutexGuard<()>>,
}

impl GatewaySession {
    async fn close(mut self) {
        let result = self.gateway.close_session().await;
        self.lock.take();
        if let Err(e) = result {
            warn!(error = %e, "middleware disconnect failed");
        }
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        error!("middleware session dropped while open, scheduling disconnect");
        let gateway = Arc::clone(&self.gateway);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = gateway.close_session().await {
                        warn!(error = %e, "deferred middleware disconnect failed");
                    }
                    drop(lock);
                });
            }
            Err(_) => warn!("no runtime available to disconnect middleware session"),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Sends credits through a [`DeviceGateway`] one session at a time.
pub struct CreditDispatcher {
    gateway: Arc<dyn DeviceGateway>,
    session_lock: Arc<Mutex<()>>,
}

impl CreditDispatcher {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self {
            gateway,
            session_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn DeviceGateway> {
        &self.gateway
    }

    /// Open a session, send one credit, close the session.
    pub async fn dispatch_one(&self, credit: LabeledCredit) -> ItemOutcome {
        let session = match self.open().await {
            Ok(s) => s,
            Err(message) => return ItemOutcome::failed(credit, message),
        };
        let outcome = self.send(credit).await;
        session.close().await;
        outcome
    }

    /// Send every credit over one session, in order, continuing on error.
    pub async fn dispatch_batch(&self, credits: Vec<LabeledCredit>) -> BatchResult {
        if credits.is_empty() {
            return BatchResult::failed(credits, "nothing to send".to_string());
        }
        let total = credits.len();

        let session = match self.open().await {
            Ok(s) => s,
            Err(message) => return BatchResult::failed(credits, message),
        };

        let mut items = Vec::with_capacity(total);
        for (i, credit) in credits.into_iter().enumerate() {
            info!(index = i + 1, total, credit = %credit.target, "sending batch credit");
            let outcome = self.send(credit).await;
            if !outcome.success {
                warn!(index = i + 1, total, error = %outcome.message, "batch credit failed");
            }
            items.push(outcome);
        }

        session.close().await;

        let success_count = items.iter().filter(|o| o.success).count();
        let result = BatchResult {
            success: success_count == total,
            total,
            success_count,
            message: format!("{success_count}/{total} credits sent"),
            items,
        };
        info!(
            success_count,
            total,
            partial = result.is_partial(),
            "credit batch finished"
        );
        result
    }

    async fn open(&self) -> Result<GatewaySession, String> {
        let lock = Arc::clone(&self.session_lock).lock_owned().await;
        match self.gateway.open_session().await {
            Ok(_) => Ok(GatewaySession {
                gateway: Arc::clone(&self.gateway),
                lock: Some(lock),
            }),
            Err(e) => {
                warn!(error = %e, "middleware connect failed");
                Err(format!("cannot open middleware session: {e}"))
            }
        }
    }

    async fn send(&self, credit: LabeledCredit) -> ItemOutcome {
        match self.gateway.send_credit(&credit.target).await {
            Ok(ack) => ItemOutcome {
                target: credit.target,
                label: credit.label,
                success: true,
                message: ack.message,
                response: ack.payload,
            },
            Err(e) => ItemOutcome::failed(credit, e.to_string()),
        }
    }
}

// ===========================================================================
// Test double
// ===========================================================================

/// Scripted in-memory gateway shared by the unit tests of this crate.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{GatewayAck, GatewayStatus};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Open,
        Send(CreditTarget),
        Close,
    }

    #[derive(Default)]
    pub struct FakeGateway {
        pub calls: StdMutex<Vec<Call>>,
        /// Scripted send results, consumed in order; empty means success.
        pub send_script: StdMutex<VecDeque<Result<(), GatewayError>>>,
        pub fail_open: bool,
        pub fail_close: bool,
        /// Awaited inside every send so concurrent callers really overlap.
        pub send_delay: Option<std::time::Duration>,
    }

    impl FakeGateway {
        pub fn with_sends(script: Vec<Result<(), GatewayError>>) -> Self {
            Self {
                send_script: StdMutex::new(script.into()),
                ..Self::default()
            }
        }

        pub fn slow(delay: std::time::Duration) -> Self {
            Self {
                send_delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn sent(&self) -> Vec<CreditTarget> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Send(t) => Some(t),
                    _ => None,
                })
                .collect()
        }

        fn ack() -> GatewayAck {
            GatewayAck {
                message: "credit sent".into(),
                payload: "OK".into(),
            }
        }
    }

    #[async_trait]
    impl DeviceGateway for FakeGateway {
        async fn open_session(&self) -> Result<GatewayAck, GatewayError> {
            self.calls.lock().unwrap().push(Call::Open);
            if self.fail_open {
                return Err(GatewayError::ConnectionRefused {
                    url: "http://fake".into(),
                });
            }
            Ok(Self::ack())
        }

        async fn send_credit(&self, target: &CreditTarget) -> Result<GatewayAck, GatewayError> {
            self.calls.lock().unwrap().push(Call::Send(*target));
            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.send_script.lock().unwrap().pop_front();
            match scripted {
                Some(Err(e)) => Err(e),
                _ => Ok(Self::ack()),
            }
        }

        async fn close_session(&self) -> Result<GatewayAck, GatewayError> {
            self.calls.lock().unwrap().push(Call::Close);
            if self.fail_close {
                return Err(GatewayError::Timeout {
                    url: "http://fake".into(),
                });
            }
            Ok(Self::ack())
        }

        async fn status(&self) -> Result<GatewayStatus, GatewayError> {
            Ok(GatewayStatus {
                connected: true,
                port: Some("COM1".into()),
                baudrate: Some(9600),
            })
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::fake::{Call, FakeGateway};
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::Sign;
    use std::time::Duration;

    fn credit(plu: u32) -> LabeledCredit {
        LabeledCredit::new(
            CreditTarget::new(3, &plu.to_string(), Sign::Plus, 1).unwrap(),
            format!("plu {plu}"),
        )
    }

    fn rejected() -> Result<(), GatewayError> {
        Err(GatewayError::DeviceRejected("no".into()))
    }

    #[tokio::test]
    async fn test_empty_batch_is_failure() {
        let gateway = Arc::new(FakeGateway::default());
        let dispatcher = CreditDispatcher::new(gateway.clone());
        let result = dispatcher.dispatch_batch(Vec::new()).await;
        assert!(!result.success);
        assert_eq!(result.total, 0);
        assert_eq!(result.message, "nothing to send");
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_all_fail_batch_closes_exactly_once() {
        let gateway = Arc::new(FakeGateway::with_sends(vec![
            rejected(),
            rejected(),
            rejected(),
        ]));
        let dispatcher = CreditDispatcher::new(gateway.clone());
        let result = dispatcher
            .dispatch_batch(vec![credit(1), credit(2), credit(3)])
            .await;

        assert!(!result.success);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.total, 3);
        let calls = gateway.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::Open).count(), 1);
        assert_eq!(gateway.sent().len(), 3);
        assert_eq!(calls.iter().filter(|c| **c == Call::Close).count(), 1);
        assert_eq!(calls.last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_partial_batch_keeps_order() {
        let gateway = Arc::new(FakeGateway::with_sends(vec![Ok(()), rejected(), Ok(())]));
        let dispatcher = CreditDispatcher::new(gateway.clone());
        let result = dispatcher
            .dispatch_batch(vec![credit(4), credit(5), credit(6)])
            .await;

        assert!(!result.success);
        assert!(result.is_partial());
        assert_eq!(result.success_count, 2);
        let plus: Vec<u32> = gateway.sent().iter().map(|t| t.plu_no()).collect();
        assert_eq!(plus, vec![4, 5, 6]);
        assert!(!result.items[1].success);
        assert!(result.items[1].message.contains("rejected"));
    }

    #[tokio::test]
    async fn test_open_failure_short_circuits() {
        let gateway = Arc::new(FakeGateway {
            fail_open: true,
            ..FakeGateway::default()
        });
        let dispatcher = CreditDispatcher::new(gateway.clone());
        let result = dispatcher.dispatch_batch(vec![credit(1), credit(2)]).await;

        assert!(!result.success);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.total, 2);
        assert!(result.message.contains("cannot open middleware session"));
        assert_eq!(result.items.len(), 2);
        assert!(result.items.iter().all(|i| !i.success && i.message == result.message));
        assert_eq!(gateway.calls(), vec![Call::Open]);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_mask_send() {
        let gateway = Arc::new(FakeGateway {
            fail_close: true,
            ..FakeGateway::default()
        });
        let dispatcher = CreditDispatcher::new(gateway.clone());
        let outcome = dispatcher.dispatch_one(credit(9)).await;
        assert!(outcome.success);
        assert_eq!(
            gateway.calls(),
            vec![Call::Open, Call::Send(credit(9).target), Call::Close]
        );
    }

    #[tokio::test]
    async fn test_dispatch_one_closes_after_failed_send() {
        let gateway = Arc::new(FakeGateway::with_sends(vec![rejected()]));
        let dispatcher = CreditDispatcher::new(gateway.clone());
        let outcome = dispatcher.dispatch_one(credit(2)).await;
        assert!(!outcome.success);
        assert_eq!(gateway.calls().last(), Some(&Call::Close));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_batches_do_not_interleave() {
        let gateway = Arc::new(FakeGateway::slow(Duration::from_millis(20)));
        let dispatcher = Arc::new(CreditDispatcher::new(gateway.clone()));

        let a = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.dispatch_batch(vec![credit(1), credit(2)]).await })
        };
        let b = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.dispatch_batch(vec![credit(7), credit(8)]).await })
        };
        assert!(a.await.unwrap().success);
        assert!(b.await.unwrap().success);

        // Every session must be Open, Send, Send, Close with no foreign calls inside.
        let calls = gateway.calls();
        assert_eq!(calls.len(), 8);
        for chunk in calls.chunks(4) {
            assert_eq!(chunk[0], Call::Open);
            assert_eq!(chunk[3], Call::Close);
            let plus: Vec<u32> = chunk[1..3]
                .iter()
                .map(|c| match c {
                    Call::Send(t) => t.plu_no(),
                    other => panic!("unexpected call inside session: {other:?}"),
                })
                .collect();
            assert!(plus == vec![1, 2] || plus == vec![7, 8], "{plus:?}");
        }
    }

    #[tokio::test]
    async fn test_abandoned_session_disconnects_before_next_opens() {
        let gateway = Arc::new(FakeGateway::slow(Duration::from_millis(50)));
        let dispatcher = CreditDispatcher::new(gateway.clone());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            dispatcher.dispatch_batch(vec![credit(1), credit(2)]),
        )
        .await;
        assert!(abandoned.is_err());

        let result = dispatcher.dispatch_batch(vec![credit(7), credit(8)]).await;
        assert!(result.success);

        assert_eq!(
            gateway.calls(),
            vec![
                Call::Open,
                Call::Send(credit(1).target),
                Call::Close,
                Call::Open,
                Call::Send(credit(7).target),
                Call::Send(credit(8).target),
                Call::Close,
            ]
        );
    }
}
