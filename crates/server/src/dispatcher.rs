use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framer::{FrameError, FrameReader, FrameWriter};
use protocol::{
    ConfigError, ConnectionId, DeadlinePolicy, ErrorKind, ErrorPayload, ExtensionRegistry,
    Message, Notification, Request, Response, ServerConfig, Timestamp, Value,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::{CallKind, CallObserver, CallRecord, Handler, Method, TracingObserver};

/// Per-call dispatch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOptions {
    /// Handler deadline; `None` disables it.
    pub timeout: Option<Duration>,
    /// What happens to a handler that overruns `timeout`.
    pub deadline_policy: DeadlinePolicy,
    /// Emit a [`CallRecord`] for every call, not only overruns.
    pub debug: bool,
}

impl DispatchOptions {
    /// Takes the dispatch settings out of a server configuration.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            timeout: config.timeout()?,
            deadline_policy: config.deadline_policy,
            debug: config.debug,
        })
    }
}

/// Runs one connection's message loop against a [`Handler`].
///
/// Each call runs in its own task so a panicking handler is contained, but the
/// loop awaits it before reading the next message: calls on one connection
/// never overlap and responses leave in request order.
pub struct Dispatcher {
    handler: Handler,
    options: DispatchOptions,
    observer: Arc<dyn CallObserver>,
    extensions: ExtensionRegistry,
}

impl Dispatcher {
    /// Creates a dispatcher that reports to a [`TracingObserver`].
    pub fn new(handler: Handler, options: DispatchOptions) -> Self {
        Self {
            handler,
            options,
            observer: Arc::new(TracingObserver),
            extensions: ExtensionRegistry::new(),
        }
    }

    /// Checks request parameters against `registry` before dispatch. A
    /// registered ext value that fails to decode is rejected as
    /// `InvalidParamsError` without running the handler.
    pub fn with_extensions(mut self, registry: ExtensionRegistry) -> Self {
        self.extensions = registry;
        self
    }

    /// Replaces the default [`TracingObserver`].
    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The method table calls are resolved against.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// The settings every call is dispatched with.
    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    /// Serves messages until the peer closes the stream.
    ///
    /// Returns `Ok(())` on a clean close. Any other framing failure (reset,
    /// EOF inside a frame, undecodable bytes) is returned and the caller is
    /// expected to drop the connection.
    pub async fn serve<R, W>(
        &self,
        connection: ConnectionId,
        mut reader: FrameReader<R>,
        mut writer: FrameWriter<W>,
    ) -> Result<(), FrameError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let message = match reader.next_message().await {
                Ok(message) => message,
                Err(err) if err.is_clean_close() => return Ok(()),
                Err(err) => return Err(err),
            };

            match message {
                Message::Request(request) => {
                    let response = self.handle_request(connection, request).await;
                    writer.write_message(&response.into()).await?;
                }
                Message::Notification(notification) => {
                    self.handle_notification(connection, notification).await;
                }
                Message::Response(response) => {
                    warn!(
                        connection = %connection,
                        msgid = %response.msgid,
                        "discarding response sent to server"
                    );
                }
            }
        }
    }

    /// Invokes the requested method and builds the matching response.
    pub async fn handle_request(&self, connection: ConnectionId, request: Request) -> Response {
        debug!(msgid = %request.msgid, method = %request.method, "dispatching request");
        let outcome = self
            .invoke(connection, CallKind::Request, request.method, request.params)
            .await;
        Response {
            msgid: request.msgid,
            outcome: outcome.map_err(|payload| payload.to_value()),
        }
    }

    /// Invokes the named method and discards its result.
    pub async fn handle_notification(&self, connection: ConnectionId, notification: Notification) {
        let method = notification.method.clone();
        if let Err(error) = self
            .invoke(
                connection,
                CallKind::Notification,
                notification.method,
                notification.params,
            )
            .await
        {
            warn!(method = %method, error = %error, "notification failed");
        }
    }

    async fn invoke(
        &self,
        connection: ConnectionId,
        kind: CallKind,
        method: String,
        params: Vec<Value>,
    ) -> Result<Value, ErrorPayload> {
        let started_at = Timestamp::now();
        let start = Instant::now();
        let recorded_params = if self.options.debug {
            params.clone()
        } else {
            Vec::new()
        };

        let (outcome, aborted) = match self.handler.resolve(&method) {
            Some(target) => match self.extensions.check(&params) {
                Ok(()) => self.run(target, params).await,
                Err(err) => (
                    Err(ErrorPayload::new(ErrorKind::InvalidParams, err.to_string())),
                    false,
                ),
            },
            None => (Err(ErrorPayload::method_not_found(&method)), false),
        };

        let elapsed = start.elapsed();
        let timed_out = aborted || self.options.timeout.is_some_and(|limit| elapsed > limit);
        if self.options.debug || timed_out {
            self.observer.record(&CallRecord {
                connection,
                kind,
                method,
                params: recorded_params,
                outcome: outcome.clone(),
                started_at,
                elapsed,
                timed_out,
            });
        }
        outcome
    }

    /// Runs `method` in its own task. The flag is `true` when the task was
    /// aborted at the deadline.
    async fn run(
        &self,
        method: Arc<dyn Method>,
        params: Vec<Value>,
    ) -> (Result<Value, ErrorPayload>, bool) {
        let mut task = tokio::spawn(async move { method.invoke(params).await });

        let joined = match (self.options.timeout, self.options.deadline_policy) {
            (Some(limit), DeadlinePolicy::Abort) => {
                match tokio::time::timeout(limit, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        let payload = ErrorPayload::new(
                            ErrorKind::Timeout,
                            format!("call exceeded {:.3}s deadline", limit.as_secs_f64()),
                        );
                        return (Err(payload), true);
                    }
                }
            }
            _ => task.await,
        };

        let outcome = match joined {
            Ok(result) => result.map_err(ErrorPayload::from),
            Err(err) => Err(ErrorPayload::new(ErrorKind::Invocation, join_failure(err))),
        };
        (outcome, false)
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("handler task failed: {err}");
    }
    let panic = err.into_panic();
    match panic_text(panic.as_ref()) {
        Some(text) => format!("handler panicked: {text}"),
        None => "handler panicked".to_owned(),
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> Option<&str> {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
}
