use crate::config::PortRange;
use crate::tftp::{MalformedDatagram, Packet, MAX_DATAGRAM_SIZE};
use async_io::Async;
use rand::Rng;
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    /// A datagram arrived but couldn't be decoded. Carries the sender so it can be told off.
    PacketParse(SocketAddr, MalformedDatagram),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::PacketParse(src, e) => write!(f, "Packet parsing error from {src}: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

/// Datagram transport a session talks through.
///
/// Sessions never look at a socket directly, which lets tests run them over in-memory channels.
/// Both methods must be cancel safe: a session polls `recv_from` inside a `select!`.
pub trait Transport: Send {
    fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> impl Future<Output = io::Result<()>> + Send;

    fn recv_from(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> io::Result<()> {
        log::debug!("Sending {packet} to {dst}");
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    /// Waits for the next datagram and decodes it.
    pub async fn recv(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        let (len, src) = self.sock.recv_from(&mut buf).await?;
        let packet = Packet::parse(&buf[..len]).map_err(|e| SocketError::PacketParse(src, e))?;
        Ok((packet, src))
    }
}

impl Transport for TftpSocket {
    async fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<()> {
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.sock.recv_from(buf).await
    }
}

/// Attempts to bind to a random UDP port from `ports` until one succeeds or `attempts` run out.
pub fn bind_random_socket(ip: IpAddr, ports: PortRange, attempts: usize) -> io::Result<TftpSocket> {
    if ports.is_any() {
        return TftpSocket::bind((ip, 0).into());
    }
    if ports.begin > ports.end {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("empty port range {ports}")));
    }
    let mut rng = rand::thread_rng();
    let mut last_error = io::Error::new(io::ErrorKind::AddrInUse, "no free port in session range");
    for _ in 0..attempts {
        let port = rng.gen_range(ports.begin..=ports.end);
        match TftpSocket::bind((ip, port).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket on port {port}: {e}");
                last_error = e;
            }
        }
    }
    Err(last_error)
}
