//! # Attribution Sink
//!
//! After every applied operation the processor credits the value it added
//! (`new - old`) to the user and country that caused it. Attribution is
//! analytics: it is fire-and-forget and can never fail or slow down an apply.

use tokio::sync::mpsc;
use tracing::info;

use crate::types::AttributionRecord;

/// Receives one record per applied operation.
///
/// `record` is synchronous and must not block; implementations that talk to
/// the network should queue and return.
pub trait AttributionSink: Send + Sync + 'static {
    fn record(&self, record: AttributionRecord);
}

/// Writes each record as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAttributionSink;

impl AttributionSink for TracingAttributionSink {
    fn record(&self, record: AttributionRecord) {
        info!(
            target: "counterd::attribution",
            user_id = record.user_id.as_ref().map(|u| u.as_str()),
            country_code = record.country_code.as_ref().map(|c| c.as_str()),
            country_name = record.country_name.as_deref(),
            kind = record.delta.kind(),
            operand = record.delta.operand(),
            value_delta = %record.value_delta,
            pos = %record.pos,
            timestamp_ms = record.timestamp_ms,
            "attribution"
        );
    }
}

/// Forwards records over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelAttributionSink {
    tx: mpsc::UnboundedSender<AttributionRecord>,
}

impl ChannelAttributionSink {
    /// Creates the sink and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AttributionRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AttributionSink for ChannelAttributionSink {
    fn record(&self, record: AttributionRecord) {
        // Receiver gone: analytics is off
        let _ = self.tx.send(record);
    }
}
