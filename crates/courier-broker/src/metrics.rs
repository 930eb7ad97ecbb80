use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Values of the `event` label on `courier_messages_total`.
const EVENTS: [&str; 5] = ["published", "delivered", "acked", "requeued", "dropped"];

/// Prometheus metrics for the broker
pub struct BrokerMetrics {
    pub registry: Registry,

    // Message lifecycle counters
    pub messages_total: IntCounterVec,

    // Queue depth
    pub queue_depth: IntGaugeVec,

    // Consumer metrics
    pub consumers_connected: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new("courier_messages_total", "Messages by lifecycle event and queue"),
            &["event", "queue"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("courier_queue_depth", "Ready messages per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let consumers_connected =
            IntGauge::new("courier_consumers_connected", "Number of attached consumers")?;
        registry.register(Box::new(consumers_connected.clone()))?;

        Ok(BrokerMetrics {
            registry,
            messages_total,
            queue_depth,
            consumers_connected,
        })
    }

    /// Increment a lifecycle counter (published, delivered, acked, requeued, dropped)
    pub fn inc_messages(&self, event: &str, queue: &str) {
        self.messages_total.with_label_values(&[event, queue]).inc();
    }

    pub fn messages(&self, event: &str, queue: &str) -> u64 {
        self.messages_total.with_label_values(&[event, queue]).get()
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth.with_label_values(&[queue]).set(depth as i64);
    }

    /// Forget the per-queue series of a deleted queue
    pub fn remove_queue(&self, queue: &str) {
        let _ = self.queue_depth.remove_label_values(&[queue]);
        for event in EVENTS {
            let _ = self.messages_total.remove_label_values(&[event, queue]);
        }
    }
}
