use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use framer::{FrameError, FrameOptions};
use protocol::{ConfigError, ConnectionId, ExtensionRegistry, ServerConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{CallObserver, DispatchOptions, Dispatcher, Handler};

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Errors from starting or running a [`Server`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address that was requested.
        address: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// I/O error on the listening socket.
    #[error("listener i/o error: {0}")]
    Io(#[from] io::Error),

    /// The spawned accept loop panicked or was cancelled.
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A bound TCP listener plus the dispatcher its connections will use.
pub struct Server {
    listener: TcpListener,
    dispatcher: Dispatcher,
    frame_options: FrameOptions,
}

impl Server {
    /// Validates `config` and binds the listening socket.
    pub async fn bind(config: &ServerConfig, handler: Handler) -> Result<Self, ServerError> {
        config.validate()?;
        let options = DispatchOptions::from_config(config)?;

        let (host, port) = config.address();
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ServerError::Bind {
                address: format!("{host}:{port}"),
                source,
            })?;

        info!(
            address = %listener.local_addr()?,
            methods = handler.len(),
            timeout = ?options.timeout,
            deadline_policy = ?options.deadline_policy,
            "server listening"
        );

        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(handler, options),
            frame_options: FrameOptions::from(config),
        })
    }

    /// Replaces the call observer used by every connection.
    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.dispatcher = self.dispatcher.with_observer(observer);
        self
    }

    /// Validates registered ext values in request parameters; see
    /// [`Dispatcher::with_extensions`].
    pub fn with_extensions(mut self, registry: ExtensionRegistry) -> Self {
        self.dispatcher = self.dispatcher.with_extensions(registry);
        self
    }

    /// The address actually bound (useful with port `0`).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves, then aborts every live
    /// connection task and returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            dispatcher,
            frame_options,
        } = self;
        let dispatcher = Arc::new(dispatcher);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        let connection = ConnectionId::new_random();
                        let span = info_span!("connection", %connection, %peer);
                        connections.spawn(
                            serve_connection(Arc::clone(&dispatcher), connection, stream, frame_options)
                                .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            warn!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        info!(active = connections.len(), "server shutting down");
        connections.shutdown().await;
        Ok(())
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let local_addr = self.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            // A dropped handle also stops the server.
            let _ = stopped.await;
        }));
        Ok(ServerHandle {
            local_addr,
            stop: Some(stop),
            task,
        })
    }
}

/// Control handle for a server started with [`Server::spawn`].
///
/// Dropping the handle stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every connection, and waits for the accept
    /// loop to finish.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join().await
    }

    /// Waits for the accept loop to finish without requesting a stop.
    pub async fn join(self) -> Result<(), ServerError> {
        self.task.await?
    }
}

/// Serves a single already-connected stream until it closes.
///
/// Used by the accept loop for each TCP connection; also usable directly with
/// any duplex stream (e.g. a Unix socket or an in-memory pipe).
pub async fn serve_connection<S>(
    dispatcher: Arc<Dispatcher>,
    connection: ConnectionId,
    stream: S,
    options: FrameOptions,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!(%connection, "connection opened");
    let (reader, writer) = framer::split(stream, options);
    match dispatcher.serve(connection, reader, writer).await {
        Ok(()) => debug!(%connection, "connection closed by peer"),
        Err(FrameError::Decode(e)) => {
            warn!(%connection, error = %e, "dropping connection after undecodable data");
        }
        Err(e) => warn!(%connection, error = %e, "connection terminated"),
    }
}

#[cfg(test)]
mod tests {
    use protocol::{Message, MsgId, Request, Value};
    use tokio::net::TcpStream;

    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    fn handler() -> Handler {
        Handler::builder()
            .function("sum", |(x, y): (i64, i64)| async move { Ok(x + y) })
            .build()
    }

    #[tokio::test]
    async fn serves_calls_over_tcp_and_shuts_down() {
        let server = Server::bind(&config(), handler()).await.unwrap();
        let handle = server.spawn().unwrap();

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (mut reader, mut writer) = framer::split(stream, FrameOptions::default());
        let request = Request::new(MsgId::new(1), "sum", vec![Value::from(1), Value::from(2)]);
        writer.write_message(&request.into()).await.unwrap();
        match reader.next_message().await.unwrap() {
            Message::Response(response) => assert_eq!(response.outcome, Ok(Value::from(3))),
            other => panic!("unexpected {other:?}"),
        }

        handle.shutdown().await.unwrap();
        // The connection task was aborted, so the socket is closed.
        assert!(reader.next_message().await.is_err());
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() {
        let first = Server::bind(&config(), handler()).await.unwrap();
        let taken = ServerConfig {
            port: first.local_addr().unwrap().port(),
            ..ServerConfig::default()
        };
        let err = Server::bind(&taken, handler()).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_binding() {
        let bad = ServerConfig {
            timeout_seconds: Some(-1.0),
            ..config()
        };
        let err = Server::bind(&bad, handler()).await.err().unwrap();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
