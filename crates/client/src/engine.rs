use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use framer::{FrameOptions, FrameReader, FrameWriter};
use parking_lot::Mutex;
use protocol::{encode, ClientConfig, Message, MsgId, Notification, Request, Response, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{CallError, ConnectError, RemoteError};

type Reply = Result<Value, CallError>;

/// Frames queued for the writer task before callers start waiting.
const OUTGOING_QUEUE: usize = 64;

/// How long `close` waits for queued frames to drain before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Pending-call table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingTable {
    calls: HashMap<MsgId, oneshot::Sender<Reply>>,
    next_id: u32,
    /// Set once the connection is dead; no further calls are registered.
    closed: Option<String>,
}

impl PendingTable {
    fn allocate(&mut self) -> MsgId {
        loop {
            let id = MsgId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.calls.contains_key(&id) {
                return id;
            }
        }
    }
}

/// State shared between the calling tasks, the reader task and the writer task.
#[derive(Default)]
struct Shared {
    table: Mutex<PendingTable>,
}

impl Shared {
    fn register(&self) -> Result<(MsgId, oneshot::Receiver<Reply>), CallError> {
        let mut table = self.table.lock();
        if let Some(reason) = &table.closed {
            return Err(CallError::connection(reason.clone()));
        }
        let msgid = table.allocate();
        let (tx, rx) = oneshot::channel();
        table.calls.insert(msgid, tx);
        Ok((msgid, rx))
    }

    fn forget(&self, msgid: MsgId) {
        self.table.lock().calls.remove(&msgid);
    }

    fn deliver(&self, response: Response) {
        let waiter = self.table.lock().calls.remove(&response.msgid);
        match waiter {
            Some(tx) => {
                let reply = response
                    .outcome
                    .map_err(|value| CallError::Remote(RemoteError::from_value(value)));
                // The caller may have given up between the lookup and now.
                let _ = tx.send(reply);
            }
            None => debug!(msgid = %response.msgid, "discarding response with no pending call"),
        }
    }

    /// Marks the connection dead and fails every pending call.
    fn fail_all(&self, reason: &str) {
        let waiters: Vec<_> = {
            let mut table = self.table.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_owned());
            }
            table.calls.drain().map(|(_, tx)| tx).collect()
        };
        if !waiters.is_empty() {
            debug!(count = waiters.len(), reason, "failing pending calls");
        }
        for tx in waiters {
            let _ = tx.send(Err(CallError::connection(reason)));
        }
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        match &self.table.lock().closed {
            Some(reason) => Err(CallError::connection(reason.clone())),
            None => Ok(()),
        }
    }

    /// The error handed to callers who find the connection already gone.
    fn closed_error(&self) -> CallError {
        let reason = self.table.lock().closed.clone();
        CallError::connection(reason.unwrap_or_else(|| "connection closed".to_owned()))
    }

    fn is_alive(&self) -> bool {
        self.table.lock().closed.is_none()
    }

    fn pending(&self) -> usize {
        self.table.lock().calls.len()
    }
}

/// Removes the pending entry when a call finishes or its future is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    msgid: MsgId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.forget(self.msgid);
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match reader.next_message().await {
            Ok(Message::Response(response)) => shared.deliver(response),
            Ok(other) => {
                warn!(message_type = %other.message_type(), "ignoring non-response message from server");
            }
            Err(err) if err.is_clean_close() => {
                debug!("server closed the connection");
                break "connection closed by server".to_owned();
            }
            Err(err) => {
                error!(error = %err, "connection fault");
                break err.to_string();
            }
        }
    };
    shared.fail_all(&reason);
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Work queued for the writer task.
enum Outgoing {
    /// One encoded message. `written` is told once it has been flushed.
    Frame {
        bytes: Vec<u8>,
        written: Option<oneshot::Sender<Result<(), CallError>>>,
    },
    /// Shut down the write direction after everything queued before it.
    Shutdown { done: oneshot::Sender<()> },
}

/// Owns the write half. Every frame is written whole: callers only enqueue,
/// so a caller that gives up can never leave a partial frame on the stream.
async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
    reader: AbortHandle,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame { bytes, written } => match writer.write_frame(&bytes).await {
                Ok(()) => {
                    if let Some(tx) = written {
                        let _ = tx.send(Ok(()));
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(error = %reason, "write failed; closing connection");
                    shared.fail_all(&reason);
                    reader.abort();
                    if let Some(tx) = written {
                        let _ = tx.send(Err(CallError::connection(reason)));
                    }
                    return;
                }
            },
            Outgoing::Shutdown { done } => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "error shutting down connection");
                }
                let _ = done.send(());
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One RPC connection.
///
/// Calls may be issued concurrently from many tasks through `&Client`: each
/// gets its own msgid, and a background reader task routes every response to
/// its caller regardless of arrival order. Outgoing messages are written by a
/// second background task, so cancelling a call never corrupts the stream.
/// Dropping the client stops both tasks and closes the connection.
pub struct Client {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Outgoing>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    timeout: Option<Duration>,
    peer: Option<SocketAddr>,
}

impl Client {
    /// Connects over TCP using `config`.
    ///
    /// The configured timeout bounds the connect itself and becomes the
    /// default deadline for [`Client::call`].
    pub async fn connect(config: &ClientConfig) -> Result<Self, ConnectError> {
        config.validate()?;
        let timeout = config.timeout()?;
        let (host, port) = config.address();
        let address = format!("{host}:{port}");

        let connecting = TcpStream::connect((host, port));
        let connected = match timeout {
            Some(after) => tokio::time::timeout(after, connecting)
                .await
                .map_err(|_| ConnectError::Timeout {
                    address: address.clone(),
                    after,
                })?,
            None => connecting.await,
        };
        let stream = connected.map_err(|source| ConnectError::Io {
            address: address.clone(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%address, error = %e, "failed to set TCP_NODELAY");
        }
        let peer = stream.peer_addr().ok();
        info!(%address, "connected");

        let mut client = Self::from_stream(stream, FrameOptions::from(config)).with_timeout(timeout);
        client.peer = peer;
        Ok(client)
    }

    /// Wraps an already-connected stream. Must be called inside a tokio
    /// runtime. No default deadline is set; see [`Client::with_timeout`].
    pub fn from_stream<S>(stream: S, options: FrameOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared::default());

        let reader = FrameReader::new(read_half, options);
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        let (outgoing, queue) = mpsc::channel(OUTGOING_QUEUE);
        let writer_task = tokio::spawn(write_loop(
            FrameWriter::new(write_half),
            queue,
            Arc::clone(&shared),
            reader_task.abort_handle(),
        ));

        Self {
            shared,
            outgoing,
            reader_task,
            writer_task,
            timeout: None,
            peer: None,
        }
    }

    /// Sets the default per-call deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Calls `method` with the default deadline.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, self.timeout).await
    }

    /// Calls `method`, giving up once `timeout` has elapsed.
    ///
    /// The deadline covers queueing the request as well as waiting for the
    /// response, so a peer that stops reading cannot stall the call. A
    /// timeout only abandons this call: nothing is sent to the server and the
    /// connection stays usable. A late response is discarded.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let exchange = async {
            let (msgid, reply) = self.shared.register()?;
            let _guard = PendingGuard {
                shared: &self.shared,
                msgid,
            };

            debug!(%msgid, method, "sending request");
            let frame = encode_frame(&Request::new(msgid, method, params).into())?;
            self.enqueue(frame, None).await?;

            reply.await.unwrap_or_else(|_| Err(self.shared.closed_error()))
        };
        within(method, timeout, exchange).await
    }

    /// Calls `method` with serialisable arguments and deserialises the result.
    ///
    /// A tuple or sequence becomes the positional parameter list; `()` sends
    /// no parameters; any other value is sent as a single parameter.
    pub async fn call_as<R>(&self, method: &str, args: impl Serialize) -> Result<R, CallError>
    where
        R: DeserializeOwned,
    {
        let params = match rmpv::ext::to_value(args).map_err(|e| CallError::InvalidArguments {
            reason: e.to_string(),
        })? {
            Value::Array(items) => items,
            Value::Nil => Vec::new(),
            single => vec![single],
        };
        let result = self.call(method, params).await?;
        rmpv::ext::from_value(result).map_err(|e| CallError::InvalidResult {
            reason: e.to_string(),
        })
    }

    /// Sends a notification. Returns once it is written; there is no reply.
    ///
    /// The default deadline bounds the wait. A notification that times out
    /// may still be written later, but never partially.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), CallError> {
        debug!(method, "sending notification");
        let frame = encode_frame(&Notification::new(method, params).into())?;
        let delivery = async {
            let (written, flushed) = oneshot::channel();
            self.enqueue(frame, Some(written)).await?;
            flushed
                .await
                .unwrap_or_else(|_| Err(self.shared.closed_error()))
        };
        within(method, self.timeout, delivery).await
    }

    /// Returns `false` once the connection has failed or been closed.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending()
    }

    /// Remote address, for TCP connections.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Fails pending calls, shuts down the write side once queued frames are
    /// written, and stops both background tasks.
    pub async fn close(&self) {
        self.shared.fail_all("client closed");
        let (done, finished) = oneshot::channel();
        if self.outgoing.try_send(Outgoing::Shutdown { done }).is_ok()
            && tokio::time::timeout(SHUTDOWN_GRACE, finished).await.is_err()
        {
            debug!("peer did not drain queued frames before close");
        }
        self.writer_task.abort();
        self.reader_task.abort();
    }

    async fn enqueue(
        &self,
        bytes: Vec<u8>,
        written: Option<oneshot::Sender<Result<(), CallError>>>,
    ) -> Result<(), CallError> {
        self.shared.ensure_open()?;
        self.outgoing
            .send(Outgoing::Frame { bytes, written })
            .await
            .map_err(|_| self.shared.closed_error())
    }
}

fn encode_frame(message: &Message) -> Result<Vec<u8>, CallError> {
    encode(message).map_err(|e| CallError::InvalidArguments {
        reason: e.to_string(),
    })
}

/// Runs `work` under an optional deadline, mapping expiry to
/// [`CallError::Timeout`].
async fn within<T>(
    method: &str,
    timeout: Option<Duration>,
    work: impl Future<Output = Result<T, CallError>>,
) -> Result<T, CallError> {
    let Some(after) = timeout else {
        return work.await;
    };
    match tokio::time::timeout(after, work).await {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(method, ?after, "call timed out");
            Err(CallError::Timeout {
                method: method.to_owned(),
                after,
            })
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .field("pending", &self.pending_calls())
            .finish()
    }
}
