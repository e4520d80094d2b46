use std::time::Duration;

use protocol::{ConnectionId, ErrorPayload, Timestamp, Value};
use tracing::{debug, warn};

/// Whether a dispatched call expects a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A request; the caller waits for a response.
    Request,
    /// A notification; nothing is sent back.
    Notification,
}

/// One dispatched call, as reported to a [`CallObserver`].
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Connection the call arrived on.
    pub connection: ConnectionId,
    /// Request or notification.
    pub kind: CallKind,
    /// Method name as received.
    pub method: String,
    /// Arguments as received. Only captured while debug recording is on;
    /// empty otherwise.
    pub params: Vec<Value>,
    /// The handler's result, or the error payload sent (or, for a
    /// notification, dropped) in its place.
    pub outcome: Result<Value, ErrorPayload>,
    /// When dispatch began.
    pub started_at: Timestamp,
    /// Wall time from dispatch to outcome.
    pub elapsed: Duration,
    /// The call ran past the configured deadline.
    pub timed_out: bool,
}

/// Receives call records from the dispatcher.
///
/// A record is emitted for every call while debug recording is on, and for
/// any call that overran its deadline regardless of the debug setting.
/// `record` runs inline on the connection task and must not block.
pub trait CallObserver: Send + Sync {
    /// Called once per reported call.
    fn record(&self, record: &CallRecord);
}

/// Default observer: writes records to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CallObserver for TracingObserver {
    fn record(&self, record: &CallRecord) {
        let elapsed_ms = record.elapsed.as_secs_f64() * 1000.0;
        if record.timed_out {
            warn!(
                connection = %record.connection,
                method = %record.method,
                elapsed_ms,
                "TimeoutError: call exceeded its deadline"
            );
        }

        match &record.outcome {
            Ok(result) => debug!(
                connection = %record.connection,
                kind = ?record.kind,
                method = %record.method,
                params = ?record.params,
                result = %result,
                started_at = %record.started_at,
                elapsed_ms,
                "call completed"
            ),
            Err(error) => debug!(
                connection = %record.connection,
                kind = ?record.kind,
                method = %record.method,
                params = ?record.params,
                error = %error,
                started_at = %record.started_at,
                elapsed_ms,
                "call failed"
            ),
        }
    }
}
