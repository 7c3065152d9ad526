//! Runtime forwarder: listener, accept loop, and connection pumps
//!
//! A [`Forwarder`] is bound 1:1 to an active forward definition. It owns
//! the loopback listener, a cancellation token pair, live counters, and the
//! tasks of its in-flight connections. The remote side of each connection
//! is opened through the [`RemoteConnector`] seam so socket and Kubernetes
//! forwards share the whole accept/pump machinery.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Per-direction copy buffer size.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// How long `stop` waits for in-flight connections before abandoning them.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Read half of a remote stream.
pub type RemoteReadHalf = Box<dyn AsyncRead + Unpin + Send>;

/// Write half of a remote stream.
pub type RemoteWriteHalf = Box<dyn AsyncWrite + Unpin + Send>;

/// Opens the remote side of a connection for one forward.
///
/// Implemented by [`SocketConnector`](crate::forward::SocketConnector) and
/// [`KubernetesConnector`](crate::forward::KubernetesConnector); called once
/// per accepted client.
#[async_trait::async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Open a fresh remote stream as a read/write half pair. Failures end
    /// only the connection being established; the forwarder stays active.
    async fn connect(&self) -> Result<(RemoteReadHalf, RemoteWriteHalf)>;

    /// Human-readable target description for logs.
    fn target(&self) -> String;
}

/// The running side of one forward: listener, accept loop, and pumps.
///
/// A forwarder is started at most once; the manager builds a fresh one from
/// the definition whenever a forward (re)starts.
pub struct Forwarder {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the forwarder handle, its accept loop, and its
/// connection tasks.
struct Shared {
    name: String,
    local_port: u16,
    connector: Arc<dyn RemoteConnector>,
    active: AtomicBool,
    connection_count: AtomicUsize,
    bytes_transferred: Arc<AtomicU64>,
    next_connection_id: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl Forwarder {
    /// Create an idle forwarder. Both cancellation tokens are children of
    /// `shutdown` so daemon teardown propagates without the manager's help.
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        connector: Arc<dyn RemoteConnector>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                local_port,
                connector,
                active: AtomicBool::new(false),
                connection_count: AtomicUsize::new(0),
                bytes_transferred: Arc::new(AtomicU64::new(0)),
                next_connection_id: AtomicU64::new(1),
                started_at: Mutex::new(None),
                accept_cancel: shutdown.child_token(),
                conn_cancel: shutdown.child_token(),
                connections: Mutex::new(Vec::new()),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// The forward name this runtime belongs to.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The loopback port the listener is bound to.
    pub fn local_port(&self) -> u16 {
        self.shared.local_port
    }

    /// Whether the accept loop is running.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Number of in-flight connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connection_count.load(Ordering::SeqCst)
    }

    /// Total bytes relayed in both directions since start, updated per
    /// chunk so live throughput is observable mid-transfer.
    pub fn bytes_transferred(&self) -> u64 {
        self.shared.bytes_transferred.load(Ordering::Relaxed)
    }

    /// When the listener came up; `None` until started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.shared.started_at.lock().unwrap()
    }

    /// Bind `127.0.0.1:{local_port}` and launch the accept loop.
    ///
    /// An `AddrInUse` bind failure maps to [`Error::AddressInUse`], every
    /// other bind failure to [`Error::Bind`]; neither leaves side effects.
    pub async fn start(&self) -> Result<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.shared.local_port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                Error::AddressInUse(self.shared.local_port)
            } else {
                Error::Bind {
                    port: self.shared.local_port,
                    source: e,
                }
            }
        })?;

        *self.shared.started_at.lock().unwrap() = Some(Utc::now());
        self.shared.active.store(true, Ordering::SeqCst);
        info!(
            forward = %self.shared.name,
            port = self.shared.local_port,
            target = %self.shared.connector.target(),
            "Forwarder started"
        );

        let task = tokio::spawn(Arc::clone(&self.shared).accept_loop(listener));
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Cancel the accept loop, close the listener, and wait up to
    /// [`DRAIN_GRACE`] for in-flight connections to finish. Connections
    /// still alive afterwards are force-cancelled.
    pub async fn stop(&self) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shared.accept_cancel.cancel();
        let accept_task = self.accept_task.lock().unwrap().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.shared.connections.lock().unwrap());
        if !handles.is_empty() {
            let drain = async {
                for handle in handles {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                warn!(
                    forward = %self.shared.name,
                    "Grace period elapsed, abandoning remaining connections"
                );
                self.shared.conn_cancel.cancel();
            }
        }
        info!(forward = %self.shared.name, "Forwarder stopped");
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.accept_cancel.cancelled() => {
                    debug!(forward = %self.name, "Accept loop cancelled");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => {
                            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                            let handle =
                                tokio::spawn(Arc::clone(&self).handle_connection(client, peer, id));
                            let mut connections = self.connections.lock().unwrap();
                            connections.retain(|h| !h.is_finished());
                            connections.push(handle);
                        }
                        Err(e) => {
                            // Transient accept failures (e.g. fd exhaustion)
                            // must not kill the loop.
                            warn!(forward = %self.name, error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        // Listener drops here, releasing the port.
    }

    async fn handle_connection(self: Arc<Self>, client: TcpStream, peer: SocketAddr, id: u64) {
        let _ = client.set_nodelay(true);

        let (remote_read, remote_write) = match self.connector.connect().await {
            Ok(pair) => pair,
            Err(e) => {
                // Dropping the client socket is the close; the forwarder
                // stays active for the next connection.
                warn!(
                    forward = %self.name,
                    connection = id,
                    error = %e,
                    "Failed to open remote side, closing client"
                );
                return;
            }
        };

        debug!(
            forward = %self.name,
            connection = id,
            peer = %peer,
            target = %self.connector.target(),
            "Connection established"
        );
        self.connection_count.fetch_add(1, Ordering::SeqCst);

        let (client_read, client_write) = client.into_split();

        let upstream = copy_counted(
            client_read,
            remote_write,
            Arc::clone(&self.bytes_transferred),
        );
        let downstream = copy_counted(
            remote_read,
            client_write,
            Arc::clone(&self.bytes_transferred),
        );

        // Either direction finishing (EOF or error) ends the connection;
        // the losing copier is dropped, which closes its streams and
        // unblocks any pending read.
        tokio::select! {
            _ = self.conn_cancel.cancelled() => {
                debug!(forward = %self.name, connection = id, "Connection cancelled");
            }
            result = upstream => log_pump_end(&self.name, id, "client->remote", result),
            result = downstream => log_pump_end(&self.name, id, "remote->client", result),
        }

        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }
}

fn log_pump_end(forward: &str, id: u64, direction: &str, result: io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(forward, connection = id, direction, bytes, "Pump finished"),
        Err(e) => debug!(forward, connection = id, direction, error = %e, "Pump failed"),
    }
}

/// Copy until EOF, adding each chunk to the shared byte counter.
async fn copy_counted<R, W>(mut reader: R, mut writer: W, bytes: Arc<AtomicU64>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        bytes.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
}
