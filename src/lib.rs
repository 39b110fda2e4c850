// TFTP protocol engine for network booting.
//
// The server listens on the well-known port, resolves each RRQ/WRQ against a `backend::Backend`
// and runs the transfer on a socket of its own. Every transfer is a session task that owns its
// state outright; retransmission and give-up timing come from `retry::SequentialCall`.

pub mod backend;
pub mod config;
pub mod negotiate;
pub mod netascii;
pub mod retry;
pub mod server;
pub mod session;
pub mod socket;
pub mod tftp;
