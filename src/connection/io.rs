//! Socket I/O Tasks
//!
//! Every established socket gets a reader task and a writer task. Neither
//! touches connection state: they report through `IoEvent`s to the single
//! dispatch loop, which is the only owner of the engine.
//!
//! Bytes handed to a writer stay counted in its backlog until written. The
//! dispatch loop pauses the peer's reader while that backlog is above the
//! high-water mark; the writer reports `Drained` once it falls back to the
//! low-water mark.

use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::table::ConnId;
use crate::config::{Endpoint, ServerConfig, TargetAddr};

/// Reports from I/O tasks to the dispatch loop
#[derive(Debug)]
pub enum IoEvent {
    Connected { id: ConnId, stream: TcpStream },
    ConnectFailed { id: ConnId, error: String },
    Data { id: ConnId, data: Bytes },
    /// Read side ended; `None` means orderly EOF
    ReadClosed { id: ConnId, error: Option<String> },
    WriteFailed { id: ConnId, error: String },
    /// Everything queued before the finish request was written
    Flushed { id: ConnId },
    /// Backlog fell to the low-water mark after a drain notice was requested
    Drained { id: ConnId },
    FinishExpired { id: ConnId },
}

pub type IoEventSender = mpsc::UnboundedSender<IoEvent>;

enum WriteCmd {
    Data(Bytes),
    Finish,
}

/// Buffer sizes shared by every connection's tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLimits {
    /// Read chunk size
    pub buffer_size: usize,
    /// Backlog above which the peer stops being read
    pub high_water: usize,
    /// Backlog at or below which the peer is read again
    pub low_water: usize,
}

impl IoLimits {
    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            buffer_size: server.buffer_size,
            high_water: server.backlog_limit,
            low_water: server.backlog_limit / 2,
        }
    }
}

/// Writer-side accounting shared with the dispatch loop
#[derive(Debug, Default)]
struct Backlog {
    bytes: AtomicUsize,
    notify_drained: AtomicBool,
}

/// Tasks and channels attached to one connection. Dropping it aborts them.
#[derive(Default)]
pub struct IoHandle {
    writer_tx: Option<mpsc::UnboundedSender<WriteCmd>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    finish_timer: Option<JoinHandle<()>>,
    finish_requested: bool,
    backlog: Arc<Backlog>,
    read_gate: Option<watch::Sender<bool>>,
    reading_paused: bool,
}

impl IoHandle {
    /// Start resolving and connecting to `target`
    pub fn connecting(
        id: ConnId,
        target: Endpoint,
        connect_timeout: Duration,
        events: IoEventSender,
    ) -> Self {
        let connector = tokio::spawn(async move {
            let event = match timeout(connect_timeout, connect_endpoint(&target)).await {
                Ok(Ok(stream)) => IoEvent::Connected { id, stream },
                Ok(Err(e)) => IoEvent::ConnectFailed {
                    id,
                    error: e.to_string(),
                },
                Err(_) => IoEvent::ConnectFailed {
                    id,
                    error: format!("connect timed out after {:?}", connect_timeout),
                },
            };
            let _ = events.send(event);
        });

        let mut handle = Self::default();
        handle.connector = Some(connector);
        handle
    }

    /// Attach reader and writer tasks to an established socket
    pub fn attach(
        &mut self,
        id: ConnId,
        stream: TcpStream,
        limits: IoLimits,
        events: IoEventSender,
    ) {
        // Small relayed writes should not wait on Nagle
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(self.reading_paused);

        self.reader = Some(tokio::spawn(read_loop(
            id,
            read_half,
            limits.buffer_size,
            gate_rx,
            events.clone(),
        )));
        self.writer = Some(tokio::spawn(write_loop(
            id,
            write_half,
            writer_rx,
            self.backlog.clone(),
            limits.low_water,
            events,
        )));
        self.writer_tx = Some(writer_tx);
        self.read_gate = Some(gate_tx);
        self.connector = None;
    }

    pub fn is_attached(&self) -> bool {
        self.writer_tx.is_some()
    }

    /// Queue bytes for the writer task
    pub fn send(&self, data: Bytes) {
        if let Some(tx) = &self.writer_tx {
            let len = data.len();
            self.backlog.bytes.fetch_add(len, Ordering::AcqRel);
            if tx.send(WriteCmd::Data(data)).is_err() {
                self.backlog.bytes.fetch_sub(len, Ordering::AcqRel);
            }
        }
    }

    /// Bytes handed to the writer and not yet written
    pub fn backlog(&self) -> usize {
        self.backlog.bytes.load(Ordering::Acquire)
    }

    /// Have the writer send `Drained` once the backlog reaches the low-water mark
    pub fn request_drain_notice(&self) {
        self.backlog.notify_drained.store(true, Ordering::Release);
    }

    pub fn is_reading_paused(&self) -> bool {
        self.reading_paused
    }

    /// Stop reading from the socket until `resume_reading`
    pub fn pause_reading(&mut self) {
        self.set_reading_paused(true);
    }

    pub fn resume_reading(&mut self) {
        self.set_reading_paused(false);
    }

    fn set_reading_paused(&mut self, paused: bool) {
        self.reading_paused = paused;
        if let Some(gate) = &self.read_gate {
            gate.send_replace(paused);
        }
    }

    /// Ask the writer to shut down after everything queued so far
    pub fn request_finish(&mut self) {
        if self.finish_requested {
            return;
        }
        if let Some(tx) = &self.writer_tx {
            let _ = tx.send(WriteCmd::Finish);
            self.finish_requested = true;
        }
    }

    /// Arm the bound on how long finishing may take
    pub fn arm_finish_timer(&mut self, id: ConnId, limit: Duration, events: IoEventSender) {
        if self.finish_timer.is_some() {
            return;
        }
        self.finish_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let _ = events.send(IoEvent::FinishExpired { id });
        }));
    }
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        for task in [
            self.reader.take(),
            self.writer.take(),
            self.connector.take(),
            self.finish_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

async fn connect_endpoint(target: &Endpoint) -> std::io::Result<TcpStream> {
    let addr = match &target.host {
        TargetAddr::Ipv4(ip) => SocketAddr::new(IpAddr::V4(*ip), target.port),
        TargetAddr::Ipv6(ip) => SocketAddr::new(IpAddr::V6(*ip), target.port),
        TargetAddr::Domain(domain) => {
            debug!("Resolving domain: {}:{}", domain, target.port);
            lookup_host((domain.as_str(), target.port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("DNS resolution returned no addresses for {}", domain),
                    )
                })?
        }
    };
    TcpStream::connect(addr).await
}

async fn read_loop(
    id: ConnId,
    mut half: OwnedReadHalf,
    buffer_size: usize,
    mut gate: watch::Receiver<bool>,
    events: IoEventSender,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        // Closed gate means the handle is gone
        if gate.wait_for(|paused| !*paused).await.is_err() {
            return;
        }
        buf.reserve(buffer_size);
        match half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(IoEvent::ReadClosed { id, error: None });
                return;
            }
            Ok(n) => {
                trace!("Read {} bytes on {}", n, id);
                if events
                    .send(IoEvent::Data {
                        id,
                        data: buf.split().freeze(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(IoEvent::ReadClosed {
                    id,
                    error: Some(e.to_string()),
                });
                return;
            }
        }
    }
}

async fn write_loop(
    id: ConnId,
    mut half: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriteCmd>,
    backlog: Arc<Backlog>,
    low_water: usize,
    events: IoEventSender,
) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            WriteCmd::Data(data) => {
                if let Err(e) = half.write_all(&data).await {
                    let _ = events.send(IoEvent::WriteFailed {
                        id,
                        error: e.to_string(),
                    });
                    return;
                }
                let left = backlog.bytes.fetch_sub(data.len(), Ordering::AcqRel) - data.len();
                if left <= low_water && backlog.notify_drained.swap(false, Ordering::AcqRel) {
                    trace!("Backlog on {} down to {} bytes", id, left);
                    let _ = events.send(IoEvent::Drained { id });
                }
            }
            WriteCmd::Finish => {
                let _ = half.shutdown().await;
                let _ = events.send(IoEvent::Flushed { id });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnState, Connection, ConnectionTable, Role};
    use tokio::net::TcpListener;

    const LIMITS: IoLimits = IoLimits {
        buffer_size: 1024,
        high_water: 4096,
        low_water: 2048,
    };

    fn test_id() -> ConnId {
        ConnectionTable::default().insert(Connection::new(
            Role::Inbound,
            ConnState::Established,
            "127.0.0.1:5000",
        ))
    }

    /// Returns (local side for the handle, remote side for the test)
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (remote, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, remote.unwrap())
    }

    #[test]
    fn test_limits_from_config() {
        let mut server = ServerConfig::default();
        server.buffer_size = 4096;
        server.backlog_limit = 65536;

        let limits = IoLimits::from_config(&server);
        assert_eq!(limits.buffer_size, 4096);
        assert_eq!(limits.high_water, 65536);
        assert_eq!(limits.low_water, 32768);
    }

    #[tokio::test]
    async fn test_writer_reports_drained_backlog() {
        let (local, mut remote) = socket_pair().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let id = test_id();

        let mut handle = IoHandle::default();
        handle.attach(id, local, LIMITS, events);
        handle.request_drain_notice();
        handle.send(Bytes::from(vec![7u8; 8192]));

        let mut received = vec![0u8; 8192];
        timeout(Duration::from_secs(5), remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.iter().all(|&b| b == 7));

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, IoEvent::Drained { id: drained } if drained == id));
        assert_eq!(handle.backlog(), 0);
    }

    #[tokio::test]
    async fn test_paused_reader_holds_data_until_resumed() {
        let (local, mut remote) = socket_pair().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let id = test_id();

        let mut handle = IoHandle::default();
        handle.pause_reading();
        handle.attach(id, local, LIMITS, events);
        assert!(handle.is_reading_paused());

        remote.write_all(b"held").await.unwrap();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        handle.resume_reading();
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            IoEvent::Data { id: from, data } => {
                assert_eq!(from, id);
                assert_eq!(&data[..], b"held");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
