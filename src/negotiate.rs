// Option negotiation (RFC 2347 framework, RFC 2348 `blksize`, RFC 2349 `timeout` and `tsize`).
//
// The outcome is the list of options to echo in the OACK plus the transfer parameters they
// imply. Unknown options are always skipped. A known option with a bad value is skipped too,
// unless the server is configured to refuse such requests outright.

use crate::config::SessionConfig;
use crate::tftp::{Options, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use std::error;
use std::fmt;
use std::time::Duration;

/// How many times a negotiated `timeout` is repeated to form the retry schedule.
const NEGOTIATED_ATTEMPTS: usize = 3;

/// Which way the data flows, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// RRQ. Carries the size of the file being served, when the backend knows it.
    Read { size: Option<u64> },
    /// WRQ.
    Write,
}

/// Parameters a transfer runs with once negotiation is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size: usize,
    pub timeouts: Vec<Duration>,
    /// For reads, the size we told the client. For writes, the size the client announced.
    pub transfer_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Options to echo in the OACK, in request order. Empty means no OACK is sent.
    pub accepted: Options,
    pub transfer: TransferOptions,
}

/// A recognised option whose value is out of range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidOption {
    pub name: String,
    pub value: String,
}

impl error::Error for InvalidOption {}

impl fmt::Display for InvalidOption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Unacceptable value '{}' for option '{}'", self.value, self.name)
    }
}

fn parse_in_range<T: std::str::FromStr + PartialOrd>(value: &str, min: T, max: T) -> Option<T> {
    value.trim().parse::<T>().ok().filter(|v| *v >= min && *v <= max)
}

/// Works out what to agree to from the options a client asked for.
pub fn negotiate(
    requested: &Options,
    direction: Direction,
    config: &SessionConfig,
) -> Result<Negotiation, InvalidOption> {
    let mut accepted = Options::new();
    let mut transfer = TransferOptions {
        block_size: DEFAULT_BLOCK_SIZE,
        timeouts: config.timeouts.clone(),
        transfer_size: None,
    };

    for (name, value) in requested.iter() {
        let reply = match name.to_ascii_lowercase().as_str() {
            "blksize" => parse_in_range(value, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE).map(|size| {
                let size = size.min(config.max_block_size);
                transfer.block_size = size;
                Some(size.to_string())
            }),
            "timeout" => parse_in_range(value, 1u64, 255).map(|secs| {
                transfer.timeouts = vec![Duration::from_secs(secs); NEGOTIATED_ATTEMPTS];
                Some(secs.to_string())
            }),
            "tsize" => parse_in_range(value, 0u64, u64::MAX).map(|size| match direction {
                // A client asking for the size sends 0; any other value is echoed untouched.
                Direction::Read { size: known } if size == 0 => known.map(|known| {
                    transfer.transfer_size = Some(known);
                    known.to_string()
                }),
                _ => {
                    transfer.transfer_size = Some(size);
                    Some(size.to_string())
                }
            }),
            _ => {
                log::debug!("Ignoring unsupported option {name}={value}");
                continue;
            }
        };

        match reply {
            Some(Some(agreed)) => accepted.insert(name, agreed),
            // Valid, but nothing to say (tsize of a file whose size we can't tell).
            Some(None) => {}
            None if config.reject_invalid_options => {
                return Err(InvalidOption {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            None => log::debug!("Dropping option {name} with unacceptable value '{value}'"),
        }
    }

    Ok(Negotiation { accepted, transfer })
}
