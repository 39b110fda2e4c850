// Server and session settings.
//
// Nothing here reads files or the environment; the binary fills these in from its command line and
// tests build them directly.

use crate::tftp::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use std::error;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Retry schedule used when a client doesn't negotiate a timeout, in seconds.
pub const DEFAULT_TIMEOUTS: [u64; 3] = [1, 3, 7];

/// Upper bound for negotiated block sizes. Larger requests are clamped to this.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 8192;

pub const DEFAULT_MAX_SESSIONS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidPortRange(String),
    InvalidTimeouts(String),
    InvalidBlockSize(usize),
    NoSessions,
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidPortRange(msg) => write!(f, "invalid port range: {msg}"),
            Self::InvalidTimeouts(msg) => write!(f, "invalid timeout schedule: {msg}"),
            Self::InvalidBlockSize(size) => write!(
                f,
                "maximum block size {size} is outside {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}"
            ),
            Self::NoSessions => f.write_str("at least one concurrent session must be allowed"),
        }
    }
}

/// An inclusive range of UDP ports for transfer sockets.
///
/// `0` on its own means "any port the OS hands out"; 0 can't be part of a wider range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange { begin: 0, end: 0 };

    pub fn is_any(&self) -> bool {
        self.begin == 0
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.begin > self.end || (self.begin == 0 && self.end != 0) {
            return Err(ConfigError::InvalidPortRange(format!("{}-{}", self.begin, self.end)));
        }
        Ok(self)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange { begin: 1024, end: 65535 }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.begin == self.end {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}-{}", self.begin, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPortRange(s.to_string());
        let (begin, end) = match s.split_once('-') {
            Some((a, b)) => (a.trim().parse().map_err(|_| invalid())?, b.trim().parse().map_err(|_| invalid())?),
            None => {
                let port = s.trim().parse().map_err(|_| invalid())?;
                (port, port)
            }
        };
        PortRange { begin, end }.validate().map_err(|_| invalid())
    }
}

/// Parses a comma separated list of whole seconds, e.g. `1,3,7`.
pub fn parse_timeouts(s: &str) -> Result<Vec<Duration>, ConfigError> {
    let timeouts = s
        .split(',')
        .map(|part| part.trim().parse::<u64>().map(Duration::from_secs))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidTimeouts(format!("'{s}': {e}")))?;
    check_timeouts(&timeouts)?;
    Ok(timeouts)
}

fn check_timeouts(timeouts: &[Duration]) -> Result<(), ConfigError> {
    if timeouts.is_empty() {
        return Err(ConfigError::InvalidTimeouts("schedule is empty".to_string()));
    }
    if timeouts.iter().any(|t| t.is_zero()) {
        return Err(ConfigError::InvalidTimeouts("delays must be positive".to_string()));
    }
    Ok(())
}

/// Settings every transfer starts out with, before the client's options are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Retry schedule for each outstanding datagram. The datagram is sent right away, re-sent
    /// after every delay but the last, and the transfer gives up once the last delay passes
    /// without a reply.
    pub timeouts: Vec<Duration>,

    /// Largest block size the server agrees to.
    pub max_block_size: usize,

    /// Refuse a request carrying an option value outside its legal range, instead of quietly
    /// leaving that option out of the OACK.
    pub reject_invalid_options: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeouts: DEFAULT_TIMEOUTS.iter().copied().map(Duration::from_secs).collect(),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            reject_invalid_options: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        check_timeouts(&self.timeouts)?;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.max_block_size) {
            return Err(ConfigError::InvalidBlockSize(self.max_block_size));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Where to listen for RRQ/WRQ.
    pub bind: SocketAddr,

    /// Ports transfer sockets are drawn from.
    pub session_ports: PortRange,

    /// Most transfers allowed in flight at once.
    pub max_sessions: usize,

    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: (Ipv4Addr::UNSPECIFIED, 69).into(),
            session_ports: PortRange::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::NoSessions);
        }
        self.session_ports = self.session_ports.validate()?;
        self.session = self.session.validate()?;
        Ok(self)
    }
}
