// Per-transfer state machines.
//
// A session is created once the server has accepted a request and resolved its backend handle. It
// owns a dedicated transport bound to a fresh local port, is pinned to the requester's address
// (its TID), and runs until the transfer is done or abandoned. Each session is driven by a single
// task: datagrams, retry timer ticks and the shutdown signal all arrive through one `select!`, so
// nothing else ever touches its state.
//
// `ReadSession` serves RRQs (sends DATA, waits for ACKs) and `WriteSession` serves WRQs (sends
// ACKs, waits for DATA). The plumbing they share lives in `Link`.

mod read;
mod write;

pub use read::ReadSession;
pub use write::WriteSession;

use crate::retry::{SequentialCall, Tick};
use crate::socket::Transport;
use crate::tftp::{ErrorCode, Packet};
use std::fmt;
use std::future;
use std::io;
use std::iter;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// An OACK is out and the peer's first reply hasn't arrived yet.
    Negotiating,
    Transferring,
    Done,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Negotiating => f.write_str("negotiating"),
            SessionState::Transferring => f.write_str("transferring"),
            SessionState::Done => f.write_str("done"),
            SessionState::Aborted => f.write_str("aborted"),
        }
    }
}

/// What a finished session reports back to whoever spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub state: SessionState,
    /// Payload bytes moved, as seen on the wire.
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Something the session loop has to react to.
enum Event {
    Datagram(usize, SocketAddr),
    RecvFailed(io::Error),
    Timer(Tick<Option<Vec<u8>>>),
    Shutdown,
}

/// Resolves once shutdown is requested. If the sender is gone, nobody can ask any more, so this
/// never resolves.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let stopped = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !stopped {
        future::pending::<()>().await;
    }
}

/// Builds the retry timer for one outstanding datagram.
///
/// The datagram goes out immediately and again after every delay but the last. The last delay is
/// a silent wait; once it passes the timer is exhausted and the peer is presumed gone.
fn retransmission(bytes: Vec<u8>, timeouts: &[Duration]) -> SequentialCall<Option<Vec<u8>>> {
    let mut sends_left = timeouts.len();
    SequentialCall::new(timeouts.to_vec(), move || {
        sends_left = sends_left.checked_sub(1)?;
        Some(bytes.clone())
    })
}

/// A timer that never fires, for sessions with nothing outstanding.
fn idle_timer() -> SequentialCall<Option<Vec<u8>>> {
    SequentialCall::new(iter::empty(), || None)
}

/// The transport, the peer it is pinned to, and the timer for whatever was last sent reliably.
pub(crate) struct Link<T> {
    transport: T,
    remote: SocketAddr,
    timeouts: Vec<Duration>,
    retry: SequentialCall<Option<Vec<u8>>>,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> Link<T> {
    fn new(transport: T, remote: SocketAddr, timeouts: Vec<Duration>) -> Link<T> {
        // A receiver whose sender is already gone never reports a shutdown.
        let (_, shutdown) = watch::channel(false);
        Link {
            transport,
            remote,
            timeouts,
            retry: idle_timer(),
            shutdown,
        }
    }

    async fn next_event(&mut self, buf: &mut [u8]) -> Event {
        tokio::select! {
            received = self.transport.recv_from(buf) => match received {
                Ok((len, src)) => Event::Datagram(len, src),
                Err(e) => Event::RecvFailed(e),
            },
            tick = self.retry.tick() => Event::Timer(tick),
            _ = stop_requested(&mut self.shutdown) => Event::Shutdown,
        }
    }

    /// Applies the TID check and decodes the datagram.
    ///
    /// Only datagrams from the pinned peer get through. Strangers are told they have the wrong TID
    /// and are otherwise ignored; garbage from the peer is dropped.
    async fn screen(&mut self, raw: &[u8], src: SocketAddr) -> Option<Packet> {
        if src != self.remote {
            log::warn!("Datagram from {src} on the session with {}, ignoring", self.remote);
            // ERRORs are never answered.
            if !raw.starts_with(&[0x00, 0x05]) {
                self.send_to(&Packet::error(ErrorCode::UnknownTid, "Unknown transfer ID"), src)
                    .await;
            }
            return None;
        }
        match Packet::parse(raw) {
            Ok(packet) => {
                log::debug!("Got {packet} from {src}");
                Some(packet)
            }
            Err(e) => {
                log::debug!("Ignoring malformed datagram from {src}: {e}");
                None
            }
        }
    }

    async fn send_to(&mut self, packet: &Packet, dst: SocketAddr) {
        log::debug!("Sending {packet} to {dst}");
        if let Err(e) = self.transport.send_to(&packet.to_bytes(), dst).await {
            log::warn!("Unable to send packet to {dst}: {e}");
        }
    }

    /// Sends once, without retransmission. Used for ERRORs and repeated ACKs.
    async fn send(&mut self, packet: &Packet) {
        let remote = self.remote;
        self.send_to(packet, remote).await;
    }

    /// Sends `packet` and keeps re-sending it on the retry schedule until `settle` is called or
    /// something else is sent reliably.
    async fn send_reliably(&mut self, packet: &Packet) {
        log::debug!("Sending {packet} to {}", self.remote);
        self.retry = retransmission(packet.to_bytes(), &self.timeouts);
        if let Ok(Some(Some(bytes))) = self.retry.start(true) {
            self.transmit(&bytes).await;
        }
    }

    /// Stops retransmitting. The reply we were waiting for has arrived.
    fn settle(&mut self) {
        if self.retry.active() {
            let _ = self.retry.cancel();
        }
    }

    /// Keeps the session around for the last retry delay without sending anything.
    fn linger(&mut self) {
        let grace = self.timeouts.last().copied().unwrap_or_default();
        self.retry = SequentialCall::new(iter::once(grace), || None);
        let _ = self.retry.start(false);
    }

    /// Reacts to the retry timer. Returns `false` once the schedule is used up.
    async fn on_timer(&mut self, tick: Tick<Option<Vec<u8>>>) -> bool {
        match tick {
            Tick::Fired(Some(bytes)) => {
                log::debug!("No reply from {}, retransmitting", self.remote);
                self.transmit(&bytes).await;
                true
            }
            Tick::Fired(None) => true,
            Tick::Exhausted(_) => false,
        }
    }

    async fn transmit(&mut self, bytes: &[u8]) {
        if let Err(e) = self.transport.send_to(bytes, self.remote).await {
            log::warn!("Unable to send packet to {}: {e}", self.remote);
        }
    }

    fn retry_deadline(&self) -> Option<Instant> {
        self.retry.deadline()
    }
}
