//! Flow-control tuning policy.
//!
//! Report jobs are infrequent and long-running. A consumer that prefetches
//! eagerly claims jobs it cannot start yet while sibling instances sit idle,
//! so every transport caps both prefetch and concurrency at
//! `min(available processors, 32)` and never asks for unbounded prefetch.
//!
//! Transports with message locks additionally use a short lock so a stuck
//! message returns to the pool quickly, a long auto-renew window so a message
//! that is actually being rendered is not reclaimed, and a delivery-count limit
//! above the concurrency cap so the churn caused by the short lock does not
//! dead-letter legitimate work.
//!
//! There is no knob for error or skipped queues: the receive pipeline always
//! discards faulted and undecodable messages. Nobody drains error queues for
//! this service, so routing to them would only grow an unbounded backlog.

use std::time::Duration;

use crate::BusScheme;

/// Upper bound on concurrency and prefetch per instance.
pub const MAX_CONCURRENCY: usize = 32;

/// Lock held on a Service Bus message before it must be renewed.
pub const SERVICE_BUS_LOCK_DURATION: Duration = Duration::from_secs(30);

/// How long a message being processed keeps having its lock renewed.
pub const SERVICE_BUS_MAX_AUTO_RENEW: Duration = Duration::from_secs(2 * 60 * 60);

/// Time-to-live of a queued Service Bus request.
pub const SERVICE_BUS_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Floor for the Service Bus delivery-count limit.
pub const MIN_MAX_DELIVERY_COUNT: u32 = 10;

/// Per-transport delivery, durability and concurrency settings.
///
/// Computed once when a transport is planned; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTuningProfile {
    /// Maximum deliveries processed concurrently.
    pub concurrency_cap: usize,

    /// Maximum unacknowledged deliveries held by this instance.
    pub prefetch_count: u16,

    /// Message lock (lease) duration, for transports that lock messages.
    pub lock_duration: Option<Duration>,

    /// Total time a lock keeps being renewed while a message is processed.
    pub max_auto_renew_duration: Option<Duration>,

    /// Time-to-live of queued messages.
    pub message_ttl: Option<Duration>,

    /// Deliveries before the broker gives up on a message.
    pub max_delivery_count: Option<u32>,

    /// Queue survives broker and service restarts.
    pub durable: bool,

    /// Queue is removed when the last consumer disconnects.
    pub auto_delete: bool,
}

/// Concurrency cap for a machine with `processors` logical CPUs.
///
/// Always within `1..=MAX_CONCURRENCY`.
pub fn concurrency_cap(processors: usize) -> usize {
    processors.clamp(1, MAX_CONCURRENCY)
}

/// Logical processors available to this process (1 if unknown).
pub fn available_processors() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl TransportTuningProfile {
    /// Profile for the given transport on a machine with `processors` CPUs.
    pub fn for_scheme(scheme: BusScheme, processors: usize) -> Self {
        match scheme {
            BusScheme::RabbitMq => Self::rabbitmq(processors),
            BusScheme::ServiceBus => Self::service_bus(processors),
        }
    }

    /// RabbitMQ: durable queue, `basic.qos` prefetch equal to the cap.
    pub fn rabbitmq(processors: usize) -> Self {
        // ---
        let cap = concurrency_cap(processors);
        Self {
            concurrency_cap: cap,
            prefetch_count: cap as u16,
            ..Self::base()
        }
    }

    /// Service Bus: short lock, long auto-renew, delivery count above the cap.
    pub fn service_bus(processors: usize) -> Self {
        // ---
        let cap = concurrency_cap(processors);
        let max_delivery_count = (cap as u32 * 2).max(MIN_MAX_DELIVERY_COUNT);

        Self {
            concurrency_cap: cap,
            prefetch_count: cap as u16,
            lock_duration: Some(SERVICE_BUS_LOCK_DURATION),
            max_auto_renew_duration: Some(SERVICE_BUS_MAX_AUTO_RENEW),
            message_ttl: Some(SERVICE_BUS_MESSAGE_TTL),
            max_delivery_count: Some(max_delivery_count),
            ..Self::base()
        }
    }

    // Settings shared by every transport.
    fn base() -> Self {
        Self {
            concurrency_cap: 1,
            prefetch_count: 1,
            lock_duration: None,
            max_auto_renew_duration: None,
            message_ttl: None,
            max_delivery_count: None,
            durable: true,
            auto_delete: false,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_cap_follows_processor_count() {
        // ---
        assert_eq!(concurrency_cap(4), 4);
        assert_eq!(concurrency_cap(32), 32);
    }

    #[test]
    fn test_cap_is_clamped() {
        // ---
        assert_eq!(concurrency_cap(64), 32);
        assert_eq!(concurrency_cap(0), 1);
    }

    #[test]
    fn test_rabbitmq_profile() {
        // ---
        let profile = TransportTuningProfile::rabbitmq(4);
        assert_eq!(profile.concurrency_cap, 4);
        assert_eq!(profile.prefetch_count, 4);
        assert!(profile.durable);
        assert!(!profile.auto_delete);
        assert_eq!(profile.lock_duration, None);
    }

    #[test]
    fn test_service_bus_profile() {
        // ---
        let profile = TransportTuningProfile::service_bus(64);
        assert_eq!(profile.concurrency_cap, 32);
        assert_eq!(profile.prefetch_count, 32);

        let lock = profile.lock_duration.unwrap();
        let renew = profile.max_auto_renew_duration.unwrap();
        assert!(lock < renew);
        assert!(profile.max_delivery_count.unwrap() as usize > profile.concurrency_cap);
        assert!(profile.message_ttl.is_some());
    }

    #[test]
    fn test_delivery_count_above_cap_for_every_cap() {
        // ---
        for processors in 1..=64 {
            let profile = TransportTuningProfile::service_bus(processors);
            assert!(profile.max_delivery_count.unwrap() as usize > profile.concurrency_cap);
        }
    }

    #[test]
    fn test_for_scheme_dispatch() {
        // ---
        assert_eq!(
            TransportTuningProfile::for_scheme(BusScheme::RabbitMq, 8),
            TransportTuningProfile::rabbitmq(8)
        );
        assert_eq!(
            TransportTuningProfile::for_scheme(BusScheme::ServiceBus, 8),
            TransportTuningProfile::service_bus(8)
        );
    }
}
