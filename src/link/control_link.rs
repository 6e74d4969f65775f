//! Connection lifecycle manager for the single control session.
//!
//! `connect` spawns the handshake with a bounded timeout and, on success,
//! two tasks: a reader decoding newline-terminated text from the vehicle and
//! a writer draining the outbound command queue. All outbound writes flow
//! through that one queue, so commands reach the wire in the order they were
//! queued. Teardown is shared between every failure path and the explicit
//! `disconnect`, and is safe to run from any of them concurrently.
//!
//! # Task layout
//!
//! ```text
//! ControlLink::send ──[outbound queue]──► writer task ──► socket
//! socket ──► reader task ──► LinkEvent::Message
//! any failure / disconnect() ──► teardown ──► LinkEvent::Disconnected (once)
//! ```

use super::{ConnectionState, Endpoint, LinkError, LinkEvent};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the TCP handshake before the attempt counts as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Capacity of the event channel towards the owner.
const EVENT_BUFFER: usize = 100;

/// Capacity of the outbound command queue drained by the writer task.
const OUTBOUND_BUFFER: usize = 64;

/// Per-connection resources, created on connect and taken out of the handle
/// exactly once during teardown.
struct LinkSession {
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    /// True from connect success until the first teardown claims it; gates
    /// the single `Disconnected` event and suppresses error reports from
    /// loops that lose the race against an explicit disconnect.
    live: Arc<AtomicBool>,
}

/// Handle to the single TCP control session.
///
/// Cheap to clone; all clones drive the same session. `connect`, `send` and
/// `disconnect` are fire-and-forget: outcomes arrive on the event channel
/// returned by [`ControlLink::new`], never as return values.
#[derive(Clone)]
pub struct ControlLink {
    events: mpsc::Sender<LinkEvent>,
    session: Arc<Mutex<Option<LinkSession>>>,
    state: Arc<AtomicU8>,
}

impl ControlLink {
    /// Creates the link and the event channel its owner consumes.
    pub fn new() -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, event_rx) = mpsc::channel(EVENT_BUFFER);
        let link = Self {
            events,
            session: Arc::new(Mutex::new(None)),
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
        };
        (link, event_rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            s if s == ConnectionState::Connecting as u8 => ConnectionState::Connecting,
            s if s == ConnectionState::Connected as u8 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Starts a connection attempt to `endpoint`.
    ///
    /// Returns immediately; the attempt runs in its own task with a bounded
    /// handshake timeout. Success disables send coalescing, stores the
    /// session, reports [`LinkEvent::Connected`] and spawns the reader and
    /// writer tasks. Any failure reports [`LinkError::Connect`] and leaves
    /// the state `Disconnected` with no session stored.
    ///
    /// Precondition (not checked): no session is live. The shell disconnects
    /// before connecting again.
    pub fn connect(&self, endpoint: Endpoint) {
        let link = self.clone();
        self.set_state(ConnectionState::Connecting);
        tokio::spawn(async move {
            info!("Connecting to {}", endpoint);
            let attempt = timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
            )
            .await;
            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    error!("Connect to {} failed: {}", endpoint, e);
                    link.set_state(ConnectionState::Disconnected);
                    link.emit(LinkEvent::Error(LinkError::Connect(e.to_string())));
                    return;
                }
                Err(_) => {
                    error!("Connect to {} timed out", endpoint);
                    link.set_state(ConnectionState::Disconnected);
                    link.emit(LinkEvent::Error(LinkError::Connect(format!(
                        "timed out after {}ms",
                        CONNECT_TIMEOUT.as_millis()
                    ))));
                    return;
                }
            };

            // Commands are single short lines; latency beats throughput here.
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to disable send coalescing: {}", e);
            }

            let (read_half, write_half) = stream.into_split();
            let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
            let cancel = CancellationToken::new();
            let live = Arc::new(AtomicBool::new(true));

            {
                let mut guard = link.lock_session();
                *guard = Some(LinkSession {
                    outbound,
                    cancel: cancel.clone(),
                    live: live.clone(),
                });
            }
            link.set_state(ConnectionState::Connected);
            info!("Connected to {}", endpoint);
            link.emit(LinkEvent::Connected);

            tokio::spawn(write_loop(
                link.clone(),
                write_half,
                outbound_rx,
                cancel.clone(),
                live.clone(),
            ));
            tokio::spawn(read_loop(link.clone(), read_half, cancel, live));
        });
    }

    /// Queues one command line for transmission, fire-and-forget.
    ///
    /// With no active connection this performs no I/O and reports
    /// [`LinkError::NotConnected`]. The writer task appends the line
    /// terminator if the caller left it off.
    pub fn send(&self, line: impl Into<String>) {
        let line = line.into();
        let outbound = {
            let guard = self.lock_session();
            guard.as_ref().map(|session| session.outbound.clone())
        };
        match outbound {
            Some(outbound) => {
                if let Err(e) = outbound.try_send(line) {
                    warn!("Outbound queue rejected command: {}", e);
                    self.emit(LinkEvent::Error(LinkError::Send(e.to_string())));
                }
            }
            None => {
                debug!("Send with no active connection");
                self.emit(LinkEvent::Error(LinkError::NotConnected));
            }
        }
    }

    /// Tears the current session down.
    ///
    /// Idempotent: a second call, or a call racing a reader-triggered
    /// teardown, is a no-op. [`LinkEvent::Disconnected`] is emitted exactly
    /// once per successful connect.
    pub fn disconnect(&self) {
        debug!("Disconnect requested");
        self.teardown();
    }

    /// Shared teardown for disconnect and every failure path.
    ///
    /// Takes the session out of the handle under the lock, then cancels and
    /// emits with the lock released, so a reader tearing down its own
    /// session can never deadlock against a foreground disconnect.
    fn teardown(&self) {
        let session = {
            let mut guard = self.lock_session();
            guard.take()
        };
        let Some(session) = session else {
            debug!("Teardown with no active session");
            return;
        };
        session.cancel.cancel();
        self.set_state(ConnectionState::Disconnected);
        if session.live.swap(false, Ordering::SeqCst) {
            info!("Link disconnected");
            self.emit(LinkEvent::Disconnected);
        }
    }

    fn emit(&self, event: LinkEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping link event, owner not keeping up: {}", e);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<LinkSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drains the outbound queue into the socket, one flushed line per command.
async fn write_loop(
    link: ControlLink,
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
    live: Arc<AtomicBool>,
) {
    let mut writer = BufWriter::new(write_half);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Writer stopping");
                break;
            }
            line = outbound.recv() => match line {
                Some(line) => {
                    if let Err(e) = write_line(&mut writer, &line).await {
                        if live.load(Ordering::SeqCst) {
                            error!("Write failed: {}", e);
                            link.emit(LinkEvent::Error(LinkError::Send(e.to_string())));
                        }
                        link.teardown();
                        return;
                    }
                }
                None => break,
            },
        }
    }
    if let Err(e) = writer.flush().await {
        debug!("Final flush failed: {}", e);
    }
}

/// Writes `line` with exactly one terminator and flushes it out.
async fn write_line(
    writer: &mut BufWriter<OwnedWriteHalf>,
    line: &str,
) -> Result<(), std::io::Error> {
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}

/// Decodes newline-terminated inbound text until EOF, a read error, or
/// cancellation, then runs teardown.
///
/// EOF is not an error: a disconnect in progress closes the socket under the
/// reader, and the peer hanging up is reported as a plain disconnect.
async fn read_loop(
    link: ControlLink,
    read_half: OwnedReadHalf,
    cancel: CancellationToken,
    live: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reader stopping");
                break;
            }
            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    debug!("Inbound line: {}", line);
                    link.emit(LinkEvent::Message(line));
                }
                Ok(None) => {
                    info!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    if live.load(Ordering::SeqCst) {
                        error!("Read failed: {}", e);
                        link.emit(LinkEvent::Error(LinkError::Read(e.to_string())));
                    }
                    break;
                }
            },
        }
    }
    link.teardown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    async fn expect_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a link event")
            .expect("event channel closed")
    }

    async fn connected_pair() -> (
        ControlLink,
        mpsc::Receiver<LinkEvent>,
        tokio::net::TcpStream,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (link, mut rx) = ControlLink::new();
        link.connect(Endpoint::new("127.0.0.1", addr.port()));
        let (peer, _) = listener.accept().await.unwrap();
        assert!(matches!(expect_event(&mut rx).await, LinkEvent::Connected));
        assert_eq!(link.state(), ConnectionState::Connected);
        (link, rx, peer)
    }

    #[tokio::test]
    async fn send_without_connection_reports_error() {
        init_logging();
        let (link, mut rx) = ControlLink::new();
        link.send("forward");
        match expect_event(&mut rx).await {
            LinkEvent::Error(LinkError::NotConnected) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn round_trip_appends_exactly_one_terminator() {
        init_logging();
        let (link, _rx, mut peer) = connected_pair().await;

        link.send("forward");
        link.send("stop\n");

        let expected = b"forward\nstop\n";
        let mut buf = [0u8; 64];
        let mut received = Vec::new();
        while received.len() < expected.len() {
            let n = timeout(Duration::from_secs(2), peer.read(&mut buf))
                .await
                .expect("timed out reading from peer")
                .unwrap();
            assert!(n > 0, "peer saw EOF before both commands arrived");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);

        link.disconnect();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        init_logging();
        let (link, mut rx, _peer) = connected_pair().await;

        link.disconnect();
        link.disconnect();

        assert!(matches!(
            expect_event(&mut rx).await,
            LinkEvent::Disconnected
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "more than one teardown observed");
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_connect_reports_error_and_stays_disconnected() {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (link, mut rx) = ControlLink::new();
        link.connect(Endpoint::new("127.0.0.1", port));
        match expect_event(&mut rx).await {
            LinkEvent::Error(LinkError::Connect(_)) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn inbound_lines_are_delivered() {
        init_logging();
        let (link, mut rx, mut peer) = connected_pair().await;

        peer.write_all(b"OK\nREADY\n").await.unwrap();

        match expect_event(&mut rx).await {
            LinkEvent::Message(line) => assert_eq!(line, "OK"),
            other => panic!("unexpected event: {:?}", other),
        }
        match expect_event(&mut rx).await {
            LinkEvent::Message(line) => assert_eq!(line, "READY"),
            other => panic!("unexpected event: {:?}", other),
        }

        link.disconnect();
    }

    #[tokio::test]
    async fn peer_close_tears_down_without_error() {
        init_logging();
        let (link, mut rx, peer) = connected_pair().await;

        drop(peer);

        match expect_event(&mut rx).await {
            LinkEvent::Disconnected => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }
}
