use super::{Event, Link, SessionOutcome, SessionState};
use crate::backend::Reader;
use crate::config::SessionConfig;
use crate::negotiate::{negotiate, Direction};
use crate::socket::Transport;
use crate::tftp::{ErrorCode, Options, Packet, DEFAULT_BLOCK_SIZE, MAX_DATAGRAM_SIZE};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::Instant;

/// Serves one RRQ: sends DATA blocks and waits for each to be acknowledged.
pub struct ReadSession<T, R> {
    link: Link<T>,
    reader: R,
    options: Options,
    config: SessionConfig,
    block_size: usize,
    state: SessionState,
    /// Block most recently sent, 0 while an OACK is outstanding.
    current_block: u16,
    /// Whether `current_block` was the short one that ends the transfer.
    sent_last: bool,
    bytes: u64,
    started: Instant,
}

/// Reads up to `block_size` bytes. Anything shorter means end of file.
async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, block_size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0_u8; block_size];
    let mut filled = 0;
    // A single read may come back short without being at end of file, so keep going until the
    // block is full or the reader runs dry.
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

impl<T: Transport, R: Reader> ReadSession<T, R> {
    pub fn new(transport: T, remote: SocketAddr, reader: R, options: Options, config: SessionConfig) -> Self {
        ReadSession {
            link: Link::new(transport, remote, config.timeouts.clone()),
            reader,
            options,
            config,
            block_size: DEFAULT_BLOCK_SIZE,
            state: SessionState::Negotiating,
            current_block: 0,
            sent_last: false,
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

    /// When the outstanding datagram is next due for retransmission (or the session gives up).
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.link.retry_deadline()
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Done | SessionState::Aborted)
    }

    /// Negotiates options and sends the first datagram: an OACK if any option was accepted,
    /// otherwise DATA #1.
    pub async fn start(&mut self) {
        let direction = Direction::Read { size: self.reader.size() };
        let negotiation = match negotiate(&self.options, direction, &self.config) {
            Ok(negotiation) => negotiation,
            Err(e) => {
                log::warn!("Refusing read request from {}: {e}", self.link.remote);
                self.abort(ErrorCode::OptionNegotiation, e.to_string()).await;
                return;
            }
        };
        self.block_size = negotiation.transfer.block_size;
        self.link.timeouts = negotiation.transfer.timeouts;

        if negotiation.accepted.is_empty() {
            self.state = SessionState::Transferring;
            self.send_next_block().await;
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
            Packet::Ack { block } if block == self.current_block => {
                self.link.settle();
                if self.sent_last {
                    self.state = SessionState::Done;
                } else {
                    self.state = SessionState::Transferring;
                    self.send_next_block().await;
                }
            }
            Packet::Ack { block } => {
                log::debug!("Ignoring ACK #{block}, waiting for #{}", self.current_block);
            }
            Packet::Error { code, message } => {
                log::warn!("{} abandoned the transfer: {code:?} '{message}'", self.link.remote);
                self.link.settle();
                self.state = SessionState::Aborted;
            }
            other => {
                let message = format!("Expected to receive an Ack packet, but got {other} instead");
                self.abort(ErrorCode::Illegal, message).await;
            }
        }
    }

    async fn send_next_block(&mut self) {
        let data = match read_block(&mut self.reader, self.block_size).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Read failed while serving {}: {e}", self.link.remote);
                self.abort(ErrorCode::Undefined, format!("Failed to read from file: {e}"))
                    .await;
                return;
            }
        };
        self.current_block = self.current_block.wrapping_add(1);
        self.sent_last = data.len() < self.block_size;
        self.bytes += data.len() as u64;
        let packet = Packet::Data {
            block: self.current_block,
            data,
        };
        self.link.send_reliably(&packet).await;
    }

    /// Tells the peer why and stops.
    async fn abort(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.link.settle();
        self.link.send(&Packet::error(code, message)).await;
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
                    if !self.link.on_timer(tick).await {
                        log::warn!("No ACK for block #{} from {}, giving up", self.current_block, self.link.remote);
                        self.state = SessionState::Aborted;
                    }
                }
                Event::RecvFailed(e) => {
                    log::error!("Session socket failed: {e}");
                    self.state = SessionState::Aborted;
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BytesReader;
    use crate::netascii::NetasciiReader;
    use crate::session::testing::*;
    use crate::socket::mock::{self, MockPeer, MockTransport};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("disk on fire")))
        }
    }

    impl Reader for BrokenReader {
        fn size(&self) -> Option<u64> {
            None
        }
    }

    fn session<R: Reader>(reader: R, options: &[(&str, &str)]) -> (ReadSession<MockTransport, R>, MockPeer) {
        let (transport, peer) = mock::pair();
        let options = options.iter().copied().collect();
        (ReadSession::new(transport, client(), reader, options, SessionConfig::default()), peer)
    }

    fn ack(block: u16) -> Vec<u8> {
        Packet::Ack { block }.to_bytes()
    }

    async fn expect_data(peer: &mut MockPeer) -> (u16, Vec<u8>) {
        match peer.recv().await {
            (dst, Packet::Data { block, data }) if dst == client() => (block, data),
            other => panic!("expected DATA to the client, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_full_blocks_need_an_empty_third() {
        let (mut session, mut peer) = session(BytesReader::new(vec![0xAB; 1024]), &[]);
        session.start().await;

        for expected in 1..=3u16 {
            let (block, data) = expect_data(&mut peer).await;
            assert_eq!(block, expected);
            assert_eq!(data.len(), if expected < 3 { 512 } else { 0 });
            assert_eq!(session.state(), SessionState::Transferring);
            session.handle_datagram(&ack(block), client()).await;
        }

        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.retry_deadline(), None);
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_image_without_options() {
        let image: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let (session, mut peer) = session(BytesReader::new(image.clone()), &[]);
        let running = tokio::spawn(session.run());

        let (block, data) = expect_data(&mut peer).await;
        assert_eq!((block, &data[..]), (1, &image[..512]));
        peer.send(client(), &Packet::Ack { block: 1 });

        let (block, data) = expect_data(&mut peer).await;
        assert_eq!((block, &data[..]), (2, &image[512..]));
        peer.send(client(), &Packet::Ack { block: 2 });

        let outcome = running.await.unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert_eq!(outcome.bytes, 600);
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oack_then_negotiated_blocks() {
        let options = [("blksize", "1024"), ("tsize", "0"), ("multicast", "")];
        let (session, mut peer) = session(BytesReader::new(vec![1; 1500]), &options);
        let running = tokio::spawn(session.run());

        let (_, oack) = peer.recv().await;
        let expected: Options = [("blksize", "1024"), ("tsize", "1500")].into_iter().collect();
        assert_eq!(oack, Packet::OptionAck { options: expected });
        peer.send(client(), &Packet::Ack { block: 0 });

        assert_eq!(expect_data(&mut peer).await.1.len(), 1024);
        peer.send(client(), &Packet::Ack { block: 1 });
        assert_eq!(expect_data(&mut peer).await.1.len(), 476);
        peer.send(client(), &Packet::Ack { block: 2 });

        assert_eq!(running.await.unwrap().state, SessionState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_tid_leaves_session_alone() {
        let (mut session, mut peer) = session(BytesReader::new(vec![0; 2000]), &[]);
        session.start().await;
        expect_data(&mut peer).await;

        let deadline = session.retry_deadline();
        assert!(deadline.is_some());
        session.handle_datagram(&ack(1), stranger()).await;

        assert_eq!(session.state(), SessionState::Transferring);
        assert_eq!(session.current_block(), 1);
        assert_eq!(session.retry_deadline(), deadline);
        let (dst, reply) = peer.recv().await;
        assert_eq!(dst, stranger());
        assert!(matches!(reply, Packet::Error { code: ErrorCode::UnknownTid, .. }));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ack_is_ignored() {
        let (mut session, mut peer) = session(BytesReader::new(vec![0; 2000]), &[]);
        session.start().await;
        expect_data(&mut peer).await;
        session.handle_datagram(&ack(1), client()).await;
        expect_data(&mut peer).await;

        session.handle_datagram(&ack(1), client()).await;
        session.handle_datagram(&ack(7), client()).await;
        assert_eq!(session.current_block(), 2);
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_gets_retransmissions_then_abort() {
        let (session, mut peer) = session(BytesReader::new(vec![0; 100]), &[]);
        let begin = Instant::now();
        let running = tokio::spawn(session.run());

        let mut sent_at = Vec::new();
        for _ in 0..3 {
            assert_eq!(expect_data(&mut peer).await.0, 1);
            sent_at.push(begin.elapsed().as_secs());
        }
        assert_eq!(sent_at, vec![0, 1, 4]);

        let outcome = running.await.unwrap();
        assert_eq!(outcome.state, SessionState::Aborted);
        assert_eq!(begin.elapsed().as_secs(), 11);
        // Nobody is listening, so no ERROR either.
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiated_timeout_drives_retries() {
        let (session, mut peer) = session(BytesReader::new(vec![0; 100]), &[("timeout", "2")]);
        let begin = Instant::now();
        let running = tokio::spawn(session.run());

        for expected in [0, 2, 4] {
            assert!(matches!(peer.recv().await.1, Packet::OptionAck { .. }));
            assert_eq!(begin.elapsed().as_secs(), expected);
        }
        assert_eq!(running.await.unwrap().state, SessionState::Aborted);
        assert_eq!(begin.elapsed().as_secs(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_sends_error() {
        let (session, mut peer) = session(BrokenReader, &[]);
        let outcome = session.run().await;

        assert_eq!(outcome.state, SessionState::Aborted);
        match peer.recv().await.1 {
            Packet::Error { code, message } => {
                assert_eq!(code, ErrorCode::Undefined);
                assert!(message.contains("disk on fire"), "{message}");
            }
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_error_aborts_quietly() {
        let (mut session, mut peer) = session(BytesReader::new(vec![0; 2000]), &[]);
        session.start().await;
        expect_data(&mut peer).await;

        let error = Packet::error(ErrorCode::DiskFull, "no room").to_bytes();
        session.handle_datagram(&error, client()).await;
        assert_eq!(session.state(), SessionState::Aborted);
        assert_eq!(session.retry_deadline(), None);
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_on_read_session_is_illegal() {
        let (mut session, mut peer) = session(BytesReader::new(vec![0; 2000]), &[]);
        session.start().await;
        expect_data(&mut peer).await;

        let data = Packet::Data { block: 1, data: vec![1] }.to_bytes();
        session.handle_datagram(&data, client()).await;
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(matches!(peer.recv().await.1, Packet::Error { code: ErrorCode::Illegal, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_options_refuse_the_transfer() {
        let (transport, mut peer) = mock::pair();
        let config = SessionConfig {
            reject_invalid_options: true,
            ..SessionConfig::default()
        };
        let options = [("blksize", "4")].into_iter().collect();
        let mut session = ReadSession::new(transport, client(), BytesReader::new("x"), options, config);
        session.start().await;

        assert_eq!(session.state(), SessionState::Aborted);
        assert!(matches!(peer.recv().await.1, Packet::Error { code: ErrorCode::OptionNegotiation, .. }));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_netascii_reader_skips_tsize() {
        let reader = NetasciiReader::new(BytesReader::new("a\nb"));
        let (session, mut peer) = session(reader, &[("tsize", "0")]);
        let running = tokio::spawn(session.run());

        // The only option was dropped, so the transfer starts straight away.
        assert_eq!(expect_data(&mut peer).await, (1, b"a\r\nb".to_vec()));
        peer.send(client(), &Packet::Ack { block: 1 });
        let outcome = running.await.unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert_eq!(outcome.bytes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_number_wraps() {
        let size = 8 * 65536 + 3;
        let (mut session, mut peer) = session(BytesReader::new(vec![0; size]), &[("blksize", "8")]);
        session.start().await;
        assert!(matches!(peer.recv().await.1, Packet::OptionAck { .. }));
        session.handle_datagram(&ack(0), client()).await;

        let mut blocks = Vec::new();
        while session.state() != SessionState::Done {
            let (block, _) = expect_data(&mut peer).await;
            blocks.push(block);
            session.handle_datagram(&ack(block), client()).await;
        }
        assert_eq!(blocks.len(), 65537);
        assert_eq!(&blocks[65533..], &[65534, 65535, 0, 1]);
    }
}
