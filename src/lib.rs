//! `kcp-tunnel` — the client half of a TCP-over-reliable-UDP tunnel.
//!
//! Local applications connect to a plain TCP listener; every accepted
//! connection is multiplexed onto a single reliable-UDP (KCP) conversation
//! with an upstream server, and server traffic is demultiplexed back to the
//! right connection.
//!
//! # Architecture
//!
//! ```text
//!  TCP client ──▶ session ──▶ chunker ──▶ frame ──▶ engine ──▶ UDP ──▶ net
//!                                                                       │
//!  TCP client ◀── session ◀── frame ◀── reassembly ◀── engine ◀── UDP ◀─┘
//!
//!                       ┌──────────────────────────────┐
//!                       │          supervisor          │
//!                       │  (owns engine, table, UDP)   │
//!                       └──────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`frame`]     — multiplexer wire format (encode / decode)
//! - [`handshake`] — conversation-id agreement datagram
//! - [`transport`] — reliable-UDP engine bound to the socket
//! - [`table`]     — connection index allocation and lookup
//! - [`session`]   — per-connection TCP I/O task
//! - [`client`]    — supervisor event loop tying it all together
//! - [`config`]    — runtime configuration

pub mod client;
pub mod config;
pub mod frame;
pub mod handshake;
pub mod session;
pub mod table;
pub mod transport;
