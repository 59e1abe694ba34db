//! Relay host.
//!
//! Owns the receive gate, the pipeline and the running transport, and is the
//! single controller of the gate: `pause`/`resume` toggle admission, and
//! `shutdown` closes the gate, drains admitted work and stops the transport.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    //
    create_memory_transport,
    gated_pipeline,
    log_info,
    log_warn,
    start_bus,
    BusConfiguration,
    MemoryBroker,
    MessageConsumer,
    ReceiveGate,
    ReceivePipeline,
    Result,
    TransportPtr,
    TransportTuningProfile,
};

/// A running relay.
pub struct ReportRelay {
    gate: Arc<ReceiveGate>,
    pipeline: Arc<ReceivePipeline>,
    transport: TransportPtr,
}

impl ReportRelay {
    /// Select the transport for `config` and start consuming with `consumer`.
    ///
    /// # Errors
    ///
    /// See [`crate::start_bus`].
    pub async fn start<C>(config: &BusConfiguration, consumer: C) -> Result<Self>
    where
        C: MessageConsumer,
    {
        // ---
        let gate = Arc::new(ReceiveGate::new());
        let bus = start_bus(config, consumer, Arc::clone(&gate)).await?;

        Ok(Self {
            gate,
            pipeline: bus.pipeline,
            transport: bus.transport,
        })
    }

    /// Start consuming `queue` on an in-process broker.
    pub async fn start_in_memory<C>(
        broker: Arc<MemoryBroker>,
        queue: &str,
        tuning: TransportTuningProfile,
        consumer: C,
    ) -> Result<Self>
    where
        C: MessageConsumer,
    {
        // ---
        let gate = Arc::new(ReceiveGate::new());
        let pipeline = Arc::new(gated_pipeline(consumer, Arc::clone(&gate)));
        let transport = create_memory_transport(
            "report-relay-memory",
            broker,
            queue,
            tuning,
            Arc::clone(&pipeline),
        )
        .await?;

        Ok(Self {
            gate,
            pipeline,
            transport,
        })
    }

    /// Stop admitting new deliveries. Work already admitted continues.
    pub fn pause(&self) {
        if self.gate.pause() {
            log_info!("[{}] receive paused", self.transport.transport_id());
        }
    }

    /// Admit deliveries again, releasing every suspended one.
    pub fn resume(&self) {
        if self.gate.resume() {
            log_info!("[{}] receive resumed", self.transport.transport_id());
        }
    }

    pub fn is_paused(&self) -> bool {
        !self.gate.is_open()
    }

    /// Deliveries admitted and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.pipeline.in_flight()
    }

    pub fn transport(&self) -> &TransportPtr {
        &self.transport
    }

    /// Close the gate, wait up to `drain_timeout` for admitted work to
    /// settle, then stop the transport.
    ///
    /// Deliveries suspended at the gate are returned to the broker. If the
    /// drain times out, the transport is aborted: unfinished deliveries are
    /// cancelled and returned to the broker unsettled.
    ///
    /// # Errors
    ///
    /// Propagates a failure to stop the transport.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        // ---
        self.gate.pause();

        let id = self.transport.transport_id();
        log_info!("[{id}] draining {} in-flight deliveries", self.in_flight());

        let drained = tokio::time::timeout(drain_timeout, self.pipeline.drained())
            .await
            .is_ok();

        if drained {
            self.transport.stop().await?;
        } else {
            log_warn!(
                "[{id}] drain timed out after {drain_timeout:?} with {} deliveries in flight, aborting",
                self.in_flight()
            );
            self.transport.abort().await?;
        }
        log_info!("[{id}] relay stopped");
        Ok(())
    }
}
