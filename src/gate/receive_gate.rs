//! Receive-pipeline admission control.
//!
//! [`ReceiveGate`] plugs an [`AsyncGate`] into the receive pipeline. While the
//! gate is open every delivery is admitted. While it is closed, `pre_receive`
//! reports [`RelayError::ReceiveSuspended`] and the matching `receive_fault`
//! parks the delivery on the gate; the pipeline retries admission once the
//! gate reopens. A paused service therefore stops acknowledging new work
//! without failing it, and resumes without any polling.

use std::time::Duration;

use super::AsyncGate;
use crate::{
    //
    log_debug,
    ReceiveContext,
    ReceiveObserver,
    RelayError,
    Result,
};

/// Pipeline observer admitting or suspending deliveries.
#[derive(Debug, Default)]
pub struct ReceiveGate {
    gate: AsyncGate,
}

impl ReceiveGate {
    /// Create an open gate; consumption is enabled by default.
    pub fn new() -> Self {
        Self {
            gate: AsyncGate::new(true),
        }
    }

    /// Whether new deliveries are admitted.
    pub fn is_open(&self) -> bool {
        self.gate.is_open()
    }

    /// Admit (`true`) or suspend (`false`) new deliveries.
    pub fn set_open(&self, open: bool) {
        self.gate.set_open(open);
    }

    /// Suspend new deliveries. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        self.gate.close()
    }

    /// Resume consumption, releasing suspended deliveries. Returns `false` if
    /// not paused.
    pub fn resume(&self) -> bool {
        self.gate.open()
    }

    /// Wait until deliveries are admitted again.
    pub async fn wait_open(&self) {
        self.gate.wait().await;
    }
}

#[async_trait::async_trait]
impl ReceiveObserver for ReceiveGate {
    // ---
    async fn pre_receive(&self, ctx: &ReceiveContext) -> Result<()> {
        // ---
        if self.gate.is_open() {
            return Ok(());
        }

        log_debug!(
            "receive gate closed, suspending delivery on {} (correlation {:?})",
            ctx.queue,
            ctx.envelope.correlation_id
        );
        Err(RelayError::ReceiveSuspended)
    }

    async fn post_receive(&self, _ctx: &ReceiveContext) {}

    async fn post_consume(&self, _ctx: &ReceiveContext, _elapsed: Duration) {}

    async fn consume_fault(&self, _ctx: &ReceiveContext, _err: &RelayError) {}

    async fn receive_fault(&self, _ctx: &ReceiveContext, err: &RelayError) {
        // ---
        if err.is_transient() {
            self.gate.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::Envelope;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn context() -> ReceiveContext {
        // ---
        let env = Envelope::request(
            Bytes::from_static(b"{}"),
            Arc::from("c-1"),
            "replies".into(),
        );
        ReceiveContext::new("execute-report", env, 1)
    }

    #[tokio::test]
    async fn test_starts_open_and_admits() {
        // ---
        let gate = ReceiveGate::new();
        assert!(gate.is_open());
        assert!(gate.pre_receive(&context()).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_gate_signals_suspension() {
        // ---
        let gate = ReceiveGate::new();
        assert!(gate.pause());
        assert!(!gate.pause());

        let err = gate.pre_receive(&context()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_receive_fault_waits_for_resume() {
        // ---
        let gate = Arc::new(ReceiveGate::new());
        gate.pause();

        let fault = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.receive_fault(&context(), &RelayError::ReceiveSuspended)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fault.is_finished());

        assert!(gate.resume());
        timeout(Duration::from_secs(1), fault).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_faults_do_not_wait() {
        // ---
        let gate = ReceiveGate::new();
        gate.pause();

        let err = RelayError::Transport("channel closed".into());
        timeout(Duration::from_millis(50), gate.receive_fault(&context(), &err))
            .await
            .expect("non-transient fault must not park on the gate");
    }
}
