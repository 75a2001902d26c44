//! Signal recorder that writes accepted signals to the log.

use interlock::{RecordedSignal, SignalRecorder};
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl SignalRecorder for TracingRecorder {
    fn record(&self, event: &RecordedSignal) -> anyhow::Result<()> {
        info!(
            target: "interlock::signals",
            signal = %event.signal_type,
            code = event.code,
            sender = event.sender.as_deref().unwrap_or("-"),
            source = %event.source,
            payload = %event.payload,
            "accepted"
        );
        Ok(())
    }
}
