//! One framed TCP connection: a reader task, a writer task, and the
//! [`Connection`] handle the game thread sends through.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::connection::{Connection, Delivery, SendError};
use crate::framing::{FrameError, MAX_FRAME_LEN, check_frame_len, read_frame, write_frame};
use crate::peer::PeerId;
use crate::transport::TransportError;

/// Frames queued for one peer's writer before the peer counts as stalled.
pub const OUTBOUND_QUEUE: usize = 1024;

/// Raised by socket tasks, drained by the owning transport each tick.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Opened(Arc<TcpConnection>),
    Frame { from: PeerId, bytes: Vec<u8> },
    Closed { peer: PeerId, reason: String },
    ConnectFailed(TransportError),
}

/// Shared by the handle and both socket tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Shutdown {
    Open,
    /// Closed by us on purpose; nobody is told.
    Local,
    /// Torn down by us, but reported as a loss with this reason.
    Aborted(String),
}

/// Handle to a framed TCP connection.
///
/// `send` enqueues onto the connection's single writer task, so frames from
/// concurrent senders never interleave on the wire.
#[derive(Debug)]
pub struct TcpConnection {
    peer: PeerId,
    remote: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    valid: Arc<AtomicBool>,
    close_tx: watch::Sender<Shutdown>,
}

impl TcpConnection {
    /// Split `stream`, hand the new connection to `register`, announce it
    /// with [`SocketEvent::Opened`], then start the reader. No frame from
    /// this socket is queued ahead of its open event.
    pub(crate) async fn open(
        handle: &Handle,
        stream: TcpStream,
        peer: PeerId,
        remote: SocketAddr,
        events: mpsc::Sender<SocketEvent>,
        register: impl FnOnce(&Arc<Self>),
    ) -> Option<Arc<Self>> {
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (close_tx, close_rx) = watch::channel(Shutdown::Open);
        let valid = Arc::new(AtomicBool::new(true));

        handle.spawn(write_loop(
            writer,
            outbound_rx,
            close_rx.clone(),
            Arc::clone(&valid),
            peer,
        ));

        let conn = Arc::new(Self {
            peer,
            remote,
            outbound,
            valid: Arc::clone(&valid),
            close_tx,
        });

        register(&conn);
        if events.send(SocketEvent::Opened(Arc::clone(&conn))).await.is_err() {
            conn.close();
            return None;
        }

        handle.spawn(read_loop(reader, peer, events, close_rx, valid));
        Some(conn)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Deliberately close. Errors the tasks see afterwards are not reported.
    pub fn close(&self) {
        self.valid.store(false, Ordering::Release);
        self.close_tx.send_if_modified(|state| {
            if *state == Shutdown::Open {
                *state = Shutdown::Local;
                return true;
            }
            false
        });
    }

    /// Tear the connection down but let the owner hear about it through the
    /// usual `Closed` event, as if the remote had dropped.
    pub fn abort(&self, reason: impl Into<String>) {
        self.valid.store(false, Ordering::Release);
        let reason = reason.into();
        self.close_tx.send_if_modified(|state| {
            if *state == Shutdown::Open {
                *state = Shutdown::Aborted(reason);
                return true;
            }
            false
        });
    }
}

impl Connection for TcpConnection {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    fn send(&self, bytes: &[u8], delivery: Delivery) -> Result<(), SendError> {
        if !self.is_valid() {
            return Err(SendError::Closed(self.peer));
        }
        if check_frame_len(bytes.len()).is_err() {
            return Err(SendError::TooLarge {
                size: bytes.len(),
                max: MAX_FRAME_LEN as usize,
            });
        }
        if delivery == Delivery::Unreliable {
            tracing::trace!("{} sends unreliable traffic on the reliable stream", self.debug_name());
        }
        match self.outbound.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("{} is not draining its socket, dropping it", self.debug_name());
                self.abort("outbound queue full");
                Err(SendError::QueueFull(self.peer))
            }
            Err(TrySendError::Closed(_)) => {
                self.valid.store(false, Ordering::Release);
                Err(SendError::Closed(self.peer))
            }
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn debug_name(&self) -> String {
        format!("tcp:{}({})", self.remote, self.peer)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut closed: watch::Receiver<Shutdown>,
    valid: Arc<AtomicBool>,
    peer: PeerId,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    if *closed.borrow() == Shutdown::Open {
                        tracing::warn!("Write to {peer} failed: {e}");
                    }
                    valid.store(false, Ordering::Release);
                    break;
                }
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() != Shutdown::Open {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer: PeerId,
    events: mpsc::Sender<SocketEvent>,
    mut closed: watch::Receiver<Shutdown>,
    valid: Arc<AtomicBool>,
) {
    let reason = loop {
        tokio::select! {
            result = read_frame(&mut reader) => match result {
                Ok(bytes) => {
                    if events.send(SocketEvent::Frame { from: peer, bytes }).await.is_err() {
                        break "transport dropped".to_string();
                    }
                }
                Err(FrameError::ConnectionClosed) => break "closed by peer".to_string(),
                Err(e) => {
                    if *closed.borrow() == Shutdown::Open {
                        tracing::warn!("Dropping connection {peer}: {e}");
                    }
                    break e.to_string();
                }
            },
            changed = closed.changed() => {
                if changed.is_err() {
                    break "closed locally".to_string();
                }
                match &*closed.borrow() {
                    Shutdown::Open => {}
                    Shutdown::Local => break "closed locally".to_string(),
                    Shutdown::Aborted(reason) => break reason.clone(),
                }
            }
        }
    };

    valid.store(false, Ordering::Release);
    let silent = *closed.borrow() == Shutdown::Local;
    if !silent {
        let _ = events.send(SocketEvent::Closed { peer, reason }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    /// Open `local` as peer `id` and consume its `Opened` event.
    async fn open(
        local: TcpStream,
        id: PeerId,
    ) -> (Arc<TcpConnection>, mpsc::Receiver<SocketEvent>) {
        let (tx, mut rx) = mpsc::channel(8);
        let addr = local.peer_addr().unwrap();
        let conn = TcpConnection::open(&Handle::current(), local, id, addr, tx, |_| {})
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SocketEvent::Opened(_))));
        (conn, rx)
    }

    #[tokio::test]
    async fn test_send_writes_length_prefixed_frame() {
        let (local, mut remote) = pair().await;
        let (conn, _rx) = open(local, PeerId(1)).await;

        conn.send(b"abc", Delivery::Reliable).unwrap();
        let received = read_frame(&mut remote).await.unwrap();
        assert_eq!(received, b"abc");
    }

    #[tokio::test]
    async fn test_inbound_frames_become_events() {
        let (local, mut remote) = pair().await;
        let (_conn, mut rx) = open(local, PeerId(9)).await;

        write_frame(&mut remote, b"ping").await.unwrap();
        match rx.recv().await.unwrap() {
            SocketEvent::Frame { from, bytes } => {
                assert_eq!(from, PeerId(9));
                assert_eq!(bytes, b"ping");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_length_closes_connection() {
        let (local, mut remote) = pair().await;
        let (conn, mut rx) = open(local, PeerId(3)).await;

        remote.write_all(&0i32.to_le_bytes()).await.unwrap();
        match rx.recv().await.unwrap() {
            SocketEvent::Closed { peer, .. } => assert_eq!(peer, PeerId(3)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!conn.is_valid());
    }

    #[tokio::test]
    async fn test_close_is_silent_and_sends_eof() {
        let (local, mut remote) = pair().await;
        let (conn, mut rx) = open(local, PeerId(4)).await;

        conn.close();
        let mut buf = [0u8; 8];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "remote should see EOF");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "deliberate close must not emit Closed");
        assert!(matches!(
            conn.send(b"late", Delivery::Reliable),
            Err(SendError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_is_reported_as_closed() {
        let (local, mut remote) = pair().await;
        let (conn, mut rx) = open(local, PeerId(6)).await;

        conn.abort("too slow");
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            Some(SocketEvent::Closed { peer, reason }) => {
                assert_eq!(peer, PeerId(6));
                assert_eq!(reason, "too slow");
            }
            other => panic!("unexpected event {other:?}"),
        }
        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
        assert!(!conn.is_valid());
    }

    #[tokio::test]
    async fn test_stalled_reader_overflows_outbound_queue() {
        let (local, _remote) = pair().await;
        let (conn, mut rx) = open(local, PeerId(7)).await;

        // Current-thread runtime: the writer task cannot run until we yield.
        for _ in 0..OUTBOUND_QUEUE {
            conn.send(b"x", Delivery::Reliable).unwrap();
        }
        assert!(matches!(
            conn.send(b"x", Delivery::Reliable),
            Err(SendError::QueueFull(PeerId(7)))
        ));
        assert!(!conn.is_valid());
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            Some(SocketEvent::Closed { reason, .. }) => assert_eq!(reason, "outbound queue full"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let (local, _remote) = pair().await;
        let (conn, _rx) = open(local, PeerId(5)).await;

        let big = vec![0u8; MAX_FRAME_LEN as usize + 1];
        assert!(matches!(
            conn.send(&big, Delivery::Reliable),
            Err(SendError::TooLarge { .. })
        ));
    }
}
