// Wire format for TFTP datagrams (RFC 1350, option extension per RFC 2347).
//
// RRQ/WRQ:  0x01/0x02 | Filename | 0x00 | Mode | 0x00 | [ OptName | 0x00 | OptValue | 0x00 ]*
// DATA:     0x03 | Block # (2 bytes) | Data (0..blksize bytes)
// ACK:      0x04 | Block # (2 bytes)
// ERROR:    0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
// OACK:     0x06 | [ OptName | 0x00 | OptValue | 0x00 ]*
//
// Everything in here is pure translation between bytes and `Packet` values. Nothing in this module
// touches a socket.

use std::error;
use std::fmt;
use std::io;
use std::str::FromStr;

/// Block size used when the client doesn't negotiate one.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Smallest block size a client may ask for (RFC 2348).
pub const MIN_BLOCK_SIZE: usize = 8;

/// Largest block size a client may ask for (RFC 2348).
pub const MAX_BLOCK_SIZE: usize = 65464;

/// Largest datagram either side can legally produce: a DATA packet at `MAX_BLOCK_SIZE`.
pub const MAX_DATAGRAM_SIZE: usize = MAX_BLOCK_SIZE + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Why a buffer could not be decoded into a `Packet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedDatagram {
    /// Fewer bytes than the smallest valid datagram of that kind.
    TooShort(usize),
    UnknownOpcode(u16),
    /// The mode field was something other than octet or netascii.
    UnknownMode(String),
    /// A string field ran off the end of the buffer without its NUL terminator.
    Unterminated(&'static str),
    /// A string field was not valid UTF-8.
    InvalidString(&'static str),
    /// An option name appeared without a value.
    DanglingOption(String),
}

impl error::Error for MalformedDatagram {}

impl fmt::Display for MalformedDatagram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "Packet too short! ({len} bytes)"),
            Self::UnknownOpcode(op) => write!(f, "Unknown opcode: {op}"),
            Self::UnknownMode(mode) => write!(f, "Unknown transfer mode: '{mode}'"),
            Self::Unterminated(field) => write!(f, "{field} must be terminated with a null byte"),
            Self::InvalidString(field) => write!(f, "{field} is not valid UTF-8"),
            Self::DanglingOption(name) => write!(f, "Option '{name}' has no value"),
        }
    }
}

///////////////////////////////////////////////////////////////
// Field types

/// Transfer mode requested by the client. Mail mode is obsolete and refused at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

impl FromStr for FileMode {
    type Err = MalformedDatagram;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            _ => Err(MalformedDatagram::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    OptionNegotiation,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionNegotiation => 8,
        }
    }

    /// Codes outside the known range are treated as "not defined" rather than rejected; the
    /// message still carries whatever the peer wanted to say.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Ordered option list carried by RRQ, WRQ and OACK.
///
/// Names are compared case-insensitively but stored as the peer spelled them, so an OACK can echo
/// the client's own spelling back in the client's own order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, String)>);

impl Options {
    pub fn new() -> Options {
        Options(Vec::new())
    }

    /// Appends an option, replacing the value of an existing option with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Options::new();
        for (name, value) in iter {
            options.insert(name, value);
        }
        options
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// Options the client would like to negotiate, in the order it sent them.
        options: Options,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        options: Options,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An option acknowledgment, listing the options the server agreed to.
    OptionAck { options: Options },

    /// An error packet. An empty message means the sender didn't supply one.
    Error { code: ErrorCode, message: String },
}

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Reads a NUL-terminated string from the start of `buf`.
///
/// Returns the string and the number of bytes consumed, including the terminator.
fn string_from_buffer(buf: &[u8], field: &'static str) -> Result<(String, usize), MalformedDatagram> {
    let end = buf
        .iter()
        .position(|&c| c == 0x00)
        .ok_or(MalformedDatagram::Unterminated(field))?;
    let s = std::str::from_utf8(&buf[..end]).map_err(|_| MalformedDatagram::InvalidString(field))?;
    Ok((s.to_string(), end + 1))
}

/// Parses `name\0value\0` pairs until the buffer runs out.
///
/// Some boot ROMs pad requests with extra NUL bytes, so an empty option name ends the list.
fn parse_options(mut buf: &[u8]) -> Result<Options, MalformedDatagram> {
    let mut options = Options::new();
    while !buf.is_empty() {
        let (name, used) = string_from_buffer(buf, "Option name")?;
        buf = &buf[used..];
        if name.is_empty() {
            break;
        }
        if buf.is_empty() {
            return Err(MalformedDatagram::DanglingOption(name));
        }
        let (value, used) = string_from_buffer(buf, "Option value")?;
        buf = &buf[used..];
        options.insert(name, value);
    }
    Ok(options)
}

fn parse_request(buf: &[u8]) -> Result<(String, FileMode, Options), MalformedDatagram> {
    let (path, used) = string_from_buffer(buf, "Filename")?;
    let buf = &buf[used..];
    let (raw_mode, used) = string_from_buffer(buf, "Mode")?;
    let mode = raw_mode.parse()?;
    let options = parse_options(&buf[used..])?;
    Ok((path, mode, options))
}

fn parse_error(buf: &[u8]) -> Packet {
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    // Plenty of peers forget the terminator on the message; take what's there.
    let body = &buf[4..];
    let end = body.iter().position(|&c| c == 0x00).unwrap_or(body.len());
    let message = String::from_utf8_lossy(&body[..end]).into_owned();
    Packet::Error { code, message }
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0x00);
}

fn push_options(out: &mut Vec<u8>, options: &Options) {
    for (name, value) in options.iter() {
        push_string(out, name);
        push_string(out, value);
    }
}

impl Packet {
    /// Decodes a raw UDP payload.
    pub fn parse(buf: &[u8]) -> Result<Packet, MalformedDatagram> {
        if buf.len() < 2 {
            return Err(MalformedDatagram::TooShort(buf.len()));
        }

        match u16_from_buffer(buf) {
            OP_RRQ => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode, options })
            }
            OP_WRQ => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode, options })
            }
            OP_DATA if buf.len() >= 4 => Ok(Packet::Data {
                block: u16_from_buffer(&buf[2..4]),
                data: buf[4..].to_vec(),
            }),
            OP_ACK if buf.len() >= 4 => Ok(Packet::Ack {
                block: u16_from_buffer(&buf[2..4]),
            }),
            OP_ERROR if buf.len() >= 4 => Ok(parse_error(buf)),
            OP_OACK => Ok(Packet::OptionAck {
                options: parse_options(&buf[2..])?,
            }),
            OP_DATA | OP_ACK | OP_ERROR => Err(MalformedDatagram::TooShort(buf.len())),
            op => Err(MalformedDatagram::UnknownOpcode(op)),
        }
    }

    /// Encodes the packet. Options are written in the order they are held.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&self.opcode().to_be_bytes());
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                push_string(&mut out, path);
                push_string(&mut out, mode.as_str());
                push_options(&mut out, options);
            }
            Packet::Data { block, data } => {
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => out.extend_from_slice(&block.to_be_bytes()),
            Packet::OptionAck { options } => push_options(&mut out, options),
            Packet::Error { code, message } => {
                out.extend_from_slice(&code.as_u16().to_be_bytes());
                push_string(&mut out, message);
            }
        }
        out
    }

    pub fn opcode(&self) -> u16 {
        match self {
            Packet::ReadReq { .. } => OP_RRQ,
            Packet::WriteReq { .. } => OP_WRQ,
            Packet::Data { .. } => OP_DATA,
            Packet::Ack { .. } => OP_ACK,
            Packet::Error { .. } => OP_ERROR,
            Packet::OptionAck { .. } => OP_OACK,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error {
            code,
            message: message.into(),
        }
    }
}

/// Short form for logs; payloads are summarised rather than dumped.
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { path, mode, options } => {
                write!(f, "RRQ '{path}' ({mode}, {} options)", options.len())
            }
            Packet::WriteReq { path, mode, options } => {
                write!(f, "WRQ '{path}' ({mode}, {} options)", options.len())
            }
            Packet::Data { block, data } => write!(f, "DATA #{block} ({} bytes)", data.len()),
            Packet::Ack { block } => write!(f, "ACK #{block}"),
            Packet::OptionAck { options } => {
                f.write_str("OACK")?;
                for (name, value) in options.iter() {
                    write!(f, " {name}={value}")?;
                }
                Ok(())
            }
            Packet::Error { code, message } => write!(f, "ERROR {code:?} '{message}'"),
        }
    }
}
