use super::{Event, Link, SessionOutcome, SessionState};
use crate::backend::Writer;
use crate::config::SessionConfig;
use crate::negotiate::{negotiate, Direction};
use crate::socket::Transport;
use crate::tftp::{ErrorCode, Options, Packet, DEFAULT_BLOCK_SIZE, MAX_DATAGRAM_SIZE};
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;

/// Serves one WRQ: acknowledges DATA blocks and hands their payload to the backend.
///
/// Once the final block is written the transfer is done, but the session hangs around for one more
/// retry delay in case our last ACK got lost and the client sends the final block again.
pub struct WriteSession<T, W> {
    link: Link<T>,
    writer: W,
    options: Options,
    config: SessionConfig,
    block_size: usize,
    state: SessionState,
    /// Block most recently acknowledged, 0 before any DATA.
    current_block: u16,
    /// Size the client announced with `tsize`.
    transfer_size: Option<u64>,
    lingering: bool,
    bytes: u64,
    started: Instant,
}

impl<T: Transport, W: Writer> WriteSession<T, W> {
    pub fn new(transport: T, remote: SocketAddr, writer: W, options: Options, config: SessionConfig) -> Self {
        WriteSession {
            link: Link::new(transport, remote, config.timeouts.clone()),
            writer,
            options,
            config,
            block_size: DEFAULT_BLOCK_SIZE,
            state: SessionState::Negotiating,
            current_block: 0,
            transfer_size: None,
            lingering: false,
            bytes: 0,
            started: Instant::now(),
        }
    }

    /// Aborts the session once `shutdown` flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.link.shutdown = shutdown;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_block(&self) -> u16 {
        self.current_block
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn transfer_size(&self) -> Option<u64> {
        self.transfer_size
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.link.retry_deadline()
    }

    fn is_finished(&self) -> bool {
        match self.state {
            SessionState::Aborted => true,
            SessionState::Done => !self.lingering,
            _ => false,
        }
    }

    /// Negotiates options and invites the first block, with an OACK if any option was accepted
    /// and ACK #0 otherwise.
    pub async fn start(&mut self) {
        let negotiation = match negotiate(&self.options, Direction::Write, &self.config) {
            Ok(negotiation) => negotiation,
            Err(e) => {
                log::warn!("Refusing write request from {}: {e}", self.link.remote);
                self.abort(ErrorCode::OptionNegotiation, e.to_string()).await;
                return;
            }
        };
        self.block_size = negotiation.transfer.block_size;
        self.link.timeouts = negotiation.transfer.timeouts;
        self.transfer_size = negotiation.transfer.transfer_size;

        if negotiation.accepted.is_empty() {
            self.state = SessionState::Transferring;
            self.link.send_reliably(&Packet::Ack { block: 0 }).await;
        } else {
            self.state = SessionState::Negotiating;
            let oack = Packet::OptionAck {
                options: negotiation.accepted,
            };
            self.link.send_reliably(&oack).await;
        }
    }

    /// Feeds one datagram received on the session's transport.
    pub async fn handle_datagram(&mut self, raw: &[u8], src: SocketAddr) {
        if self.is_finished() {
            return;
        }
        if let Some(packet) = self.link.screen(raw, src).await {
            self.handle_packet(packet).await;
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Data { block, data } if !self.lingering && block == self.current_block.wrapping_add(1) => {
                self.accept_block(block, data).await;
            }
            Packet::Data { block, .. } if block == self.current_block && self.state != SessionState::Negotiating => {
                // Our ACK went missing. Say it again, but don't write the block twice.
                log::debug!("Duplicate DATA #{block} from {}", self.link.remote);
                self.link.send(&Packet::Ack { block }).await;
            }
            Packet::Data { block, .. } if self.lingering => {
                self.stop_lingering();
                let message = format!("Transfer already complete, unexpected DATA #{block}");
                self.link.send(&Packet::error(ErrorCode::Illegal, message)).await;
            }
            Packet::Data { block, .. } => {
                log::debug!("Ignoring DATA #{block}, expecting #{}", self.current_block.wrapping_add(1));
            }
            Packet::Error { code, message } => {
                log::warn!("{} abandoned the transfer: {code:?} '{message}'", self.link.remote);
                if self.lingering {
                    self.stop_lingering();
                } else {
                    self.link.settle();
                    self.discard().await;
                    self.state = SessionState::Aborted;
                }
            }
            other if self.lingering => {
                log::debug!("Ignoring {other} after the transfer completed");
            }
            other => {
                let message = format!("Expected to receive a Data packet, but got {other} instead");
                self.abort(ErrorCode::Illegal, message).await;
            }
        }
    }

    async fn accept_block(&mut self, block: u16, data: Vec<u8>) {
        if data.len() > self.block_size {
            let message = format!(
                "DATA #{block} carries {} bytes, more than the block size of {}",
                data.len(),
                self.block_size
            );
            self.abort(ErrorCode::Illegal, message).await;
            return;
        }

        self.link.settle();
        if let Err(e) = self.writer.write_all(&data).await {
            self.write_failed(e).await;
            return;
        }
        self.current_block = block;
        self.bytes += data.len() as u64;
        self.state = SessionState::Transferring;

        if data.len() == self.block_size {
            self.link.send_reliably(&Packet::Ack { block }).await;
            return;
        }

        // Short block: that was the last one.
        if let Err(e) = self.writer.finish().await {
            self.write_failed(e).await;
            return;
        }
        if let Some(announced) = self.transfer_size.filter(|&size| size != self.bytes) {
            log::warn!("{} announced {announced} bytes but sent {}", self.link.remote, self.bytes);
        }
        self.state = SessionState::Done;
        self.link.send(&Packet::Ack { block }).await;
        self.link.linger();
        self.lingering = true;
    }

    async fn write_failed(&mut self, e: io::Error) {
        log::warn!("Write failed while receiving from {}: {e}", self.link.remote);
        let code = match e.kind() {
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        };
        self.abort(code, format!("Failed to write to file: {e}")).await;
    }

    fn stop_lingering(&mut self) {
        self.lingering = false;
        self.link.settle();
    }

    /// Drops whatever was written so far.
    async fn discard(&mut self) {
        if let Err(e) = self.writer.cancel().await {
            log::warn!("Couldn't discard partial upload from {}: {e}", self.link.remote);
        }
    }

    /// Tells the peer why, discards the partial upload and stops.
    async fn abort(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.link.settle();
        self.link.send(&Packet::error(code, message)).await;
        self.discard().await;
        self.state = SessionState::Aborted;
    }

    /// Runs the transfer to completion.
    pub async fn run(mut self) -> SessionOutcome {
        self.start().await;
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        while !self.is_finished() {
            match self.link.next_event(&mut buf).await {
                Event::Datagram(len, src) => self.handle_datagram(&buf[..len], src).await,
                Event::Timer(tick) => {
                    if self.link.on_timer(tick).await {
                        continue;
                    }
                    if self.lingering {
                        self.lingering = false;
                    } else {
                        log::warn!(
                            "No DATA #{} from {}, giving up",
                            self.current_block.wrapping_add(1),
                            self.link.remote
                        );
                        self.discard().await;
                        self.state = SessionState::Aborted;
                    }
                }
                Event::RecvFailed(e) if self.lingering => {
                    log::debug!("Session socket failed after the transfer completed: {e}");
                    self.stop_lingering();
                }
                Event::RecvFailed(e) => {
                    log::error!("Session socket failed: {e}");
                    self.discard().await;
                    self.state = SessionState::Aborted;
                }
                Event::Shutdown if self.lingering => self.stop_lingering(),
                Event::Shutdown => self.abort(ErrorCode::Undefined, "Server shutting down").await,
            }
        }
        SessionOutcome {
            state: self.state,
            bytes: self.bytes,
            elapsed: self.started.elapsed(),
        }
    }
}
