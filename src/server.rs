// The listener on the well-known port.
//
// Every datagram that arrives here should be an RRQ or WRQ. Anything else is answered with an
// ERROR and forgotten. A request gets its own task, which resolves the backend handle, binds a
// fresh socket for the transfer and runs the session on it, so a slow backend only ever holds up
// its own request. Errors found before a session exists are sent from the listening socket.

use crate::backend::{Backend, BackendError, Writer};
use crate::config::{ConfigError, ServerConfig};
use crate::netascii::{NetasciiReader, NetasciiWriter};
use crate::session::{ReadSession, SessionOutcome, WriteSession};
use crate::socket::{bind_random_socket, SocketError, TftpSocket};
use crate::tftp::{ErrorCode, FileMode, Options, Packet};
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// How many random ports to try before giving up on a transfer socket.
const BIND_ATTEMPTS: usize = 32;

#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Bind(SocketAddr, io::Error),
}

impl error::Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Invalid configuration: {e}"),
            Self::Bind(addr, e) => write!(f, "Couldn't bind {addr}: {e}"),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> ServerError {
        ServerError::Config(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
}

/// An accepted RRQ or WRQ.
#[derive(Debug)]
struct Request {
    kind: Kind,
    path: String,
    mode: FileMode,
    options: Options,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let verb = match self.kind {
            Kind::Read => "read",
            Kind::Write => "write",
        };
        write!(f, "{verb} of '{}' ({})", self.path, self.mode)
    }
}

/// A TFTP server: one listening socket plus the sessions it has started.
pub struct Server<B> {
    listener: Arc<TftpSocket>,
    backend: Arc<B>,
    config: ServerConfig,
    sessions: JoinSet<()>,
    stop: watch::Sender<bool>,
}

impl<B: Backend> Server<B> {
    pub fn bind(config: ServerConfig, backend: B) -> Result<Server<B>, ServerError> {
        let config = config.validate()?;
        let listener = TftpSocket::bind(config.bind).map_err(|e| ServerError::Bind(config.bind, e))?;
        let (stop, _) = watch::channel(false);
        Ok(Server {
            listener: Arc::new(listener),
            backend: Arc::new(backend),
            config,
            sessions: JoinSet::new(),
            stop,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves requests until `shutdown` resolves, then stops every session and waits for them.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        match self.local_addr() {
            Ok(addr) => log::info!("Listening on {addr}"),
            Err(e) => log::warn!("Listening on an unknown address: {e}"),
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.listener.recv() => self.dispatch(received).await,
                Some(finished) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Session task failed: {e}");
                    }
                }
            }
        }

        log::info!("Shutting down, stopping {} sessions", self.sessions.len());
        self.stop.send_replace(true);
        while let Some(finished) = self.sessions.join_next().await {
            if let Err(e) = finished {
                log::error!("Session task failed: {e}");
            }
        }
    }

    async fn dispatch(&mut self, received: Result<(Packet, SocketAddr), SocketError>) {
        let (packet, src) = match received {
            Ok(received) => received,
            Err(SocketError::PacketParse(src, e)) => {
                log::warn!("Bad request from {src}: {e}");
                reply_error(&self.listener, src, ErrorCode::Illegal, e.to_string()).await;
                return;
            }
            Err(SocketError::IO(e)) => {
                log::error!("Listener failed to receive: {e}");
                return;
            }
        };

        let request = match packet {
            Packet::ReadReq { path, mode, options } => Request {
                kind: Kind::Read,
                path,
                mode,
                options,
            },
            Packet::WriteReq { path, mode, options } => Request {
                kind: Kind::Write,
                path,
                mode,
                options,
            },
            other => {
                log::warn!("Unexpected {other} from {src} on the listening port");
                let message = "Only read and write requests are valid initial requests.";
                reply_error(&self.listener, src, ErrorCode::Illegal, message).await;
                return;
            }
        };

        if self.sessions.len() >= self.config.max_sessions {
            log::warn!("Turning away {request} from {src}: {} transfers in flight", self.sessions.len());
            reply_error(&self.listener, src, ErrorCode::Undefined, "server busy").await;
            return;
        }

        log::info!("Starting {request} for {src}");
        self.sessions.spawn(serve(
            request,
            src,
            Arc::clone(&self.listener),
            Arc::clone(&self.backend),
            self.config.clone(),
            self.stop.subscribe(),
        ));
    }
}

async fn reply_error(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: impl Into<String>) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::error(code, message), dst).await;
}

async fn refuse(listener: &TftpSocket, src: SocketAddr, request: &Request, e: BackendError) {
    log::info!("Refusing {request} for {src}: {e}");
    reply_error(listener, src, ErrorCode::from(&e), e.to_string()).await;
}

/// Binds the socket a transfer will run on, on the same address as the listener.
async fn session_socket(listener: &TftpSocket, src: SocketAddr, config: &ServerConfig) -> Option<TftpSocket> {
    let ip = config.bind.ip();
    match bind_random_socket(ip, config.session_ports, BIND_ATTEMPTS) {
        Ok(sock) => Some(sock),
        Err(e) => {
            log::error!("No socket for the transfer with {src} in {}: {e}", config.session_ports);
            reply_error(listener, src, ErrorCode::Undefined, "No transfer port available").await;
            None
        }
    }
}

/// Resolves the request against the backend and runs the transfer.
async fn serve<B: Backend>(
    request: Request,
    src: SocketAddr,
    listener: Arc<TftpSocket>,
    backend: Arc<B>,
    config: ServerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let outcome = match request.kind {
        Kind::Read => {
            let reader = match backend.get_reader(&request.path).await {
                Ok(reader) => reader,
                Err(e) => return refuse(&listener, src, &request, e).await,
            };
            let Some(sock) = session_socket(&listener, src, &config).await else {
                return;
            };
            let options = request.options.clone();
            match request.mode {
                FileMode::NetAscii => {
                    let reader = NetasciiReader::new(reader);
                    let session = ReadSession::new(sock, src, reader, options, config.session);
                    session.with_shutdown(shutdown).run().await
                }
                FileMode::Octet => {
                    let session = ReadSession::new(sock, src, reader, options, config.session);
                    session.with_shutdown(shutdown).run().await
                }
            }
        }
        Kind::Write => {
            let mut writer = match backend.get_writer(&request.path).await {
                Ok(writer) => writer,
                Err(e) => return refuse(&listener, src, &request, e).await,
            };
            let Some(sock) = session_socket(&listener, src, &config).await else {
                if let Err(e) = writer.cancel().await {
                    log::warn!("Couldn't discard upload of '{}': {e}", request.path);
                }
                return;
            };
            let options = request.options.clone();
            match request.mode {
                FileMode::NetAscii => {
                    let writer = NetasciiWriter::new(writer);
                    let session = WriteSession::new(sock, src, writer, options, config.session);
                    session.with_shutdown(shutdown).run().await
                }
                FileMode::Octet => {
                    let session = WriteSession::new(sock, src, writer, options, config.session);
                    session.with_shutdown(shutdown).run().await
                }
            }
        }
    };
    log_outcome(&request, src, &outcome);
}

fn log_outcome(request: &Request, src: SocketAddr, outcome: &SessionOutcome) {
    log::info!(
        "Finished {request} for {src}: {} ({} bytes in {:.3}s)",
        outcome.state,
        outcome.bytes,
        outcome.elapsed.as_secs_f64()
    );
}
