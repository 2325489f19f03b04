//! Reliable-UDP engine adapter.
//!
//! [`Transport`] owns the KCP engine instance for one conversation and
//! bridges it to the connected UDP socket.  The engine is a black box: it
//! takes multiplexer frames through [`Transport::send`], raw datagrams
//! through [`Transport::input`], and hands back the reconstructed stream
//! through [`Transport::drain_into`].  Outbound datagrams leave through a
//! [`std::io::Write`] adapter doing a non-blocking send; a full socket is a
//! transient condition the engine retries on its own schedule.
//!
//! The engine only advances when [`Transport::update`] runs.  The caller
//! drives it every 10 ms and immediately after anything is injected, so no
//! frame waits a full tick for its first transmission.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use kcp::Kcp;
use log::{debug, error};
use tokio::net::UdpSocket;

/// Send and receive window, in packets.
const WINDOW_SIZE: u16 = 256;

/// Engine internal flush interval, milliseconds.
const TICK_MS: i32 = 10;

/// Duplicate-ACK count that triggers a fast resend.
const FAST_RESEND: i32 = 2;

/// Received stream bytes are pulled out of the engine in chunks this big.
const RECV_CHUNK: usize = 2048;

/// Engine-to-socket bridge: every engine-produced datagram becomes one
/// non-blocking send on the connected socket.
pub struct UdpOutput {
    socket: Arc<UdpSocket>,
}

impl Write for UdpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.try_send(buf).map_err(|e| {
            error!("udp send error: {}", e);
            e
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The reliable-UDP engine bound to one conversation and one socket.
pub struct Transport {
    kcp: Kcp<UdpOutput>,
    epoch: Instant,
}

impl Transport {
    /// Create the engine for `conv` over a connected socket: window
    /// 256/256, nodelay mode, 10 ms interval, fast resend after 2 duplicate
    /// ACKs, congestion control off.
    pub fn new(conv: u32, socket: Arc<UdpSocket>) -> Self {
        let mut kcp = Kcp::new(conv, UdpOutput { socket });
        kcp.set_wndsize(WINDOW_SIZE, WINDOW_SIZE);
        kcp.set_nodelay(true, TICK_MS, FAST_RESEND, true);
        Self { kcp, epoch: Instant::now() }
    }

    /// Milliseconds since the transport was created; the engine's clock is
    /// 32 bits and wraps.
    fn clock(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Advance engine timers and flush pending output.  Failures here are
    /// output-side and transient; the engine retransmits by itself.
    pub fn update(&mut self) {
        if let Err(e) = self.kcp.update(self.clock()) {
            debug!("engine update: {}", e);
        }
    }

    /// Feed one received datagram to the engine.  Returns false for a
    /// malformed datagram, which is logged and dropped.
    pub fn input(&mut self, datagram: &[u8]) -> bool {
        match self.kcp.input(datagram) {
            Ok(_) => true,
            Err(e) => {
                error!("engine rejected datagram: {}", e);
                false
            }
        }
    }

    /// Queue one multiplexer frame on the reliable stream.
    ///
    /// The engine accepts anything the codec can produce, so an error here
    /// indicates a programming error and the caller treats it as fatal.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), kcp::Error> {
        self.kcp.send(frame).map(drop)
    }

    /// Move every completed message out of the engine into `out`.
    pub fn drain_into(&mut self, out: &mut BytesMut) {
        let mut chunk = vec![0u8; RECV_CHUNK];
        loop {
            match self.kcp.recv(&mut chunk) {
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(kcp::Error::RecvQueueEmpty) | Err(kcp::Error::ExpectingFragment) => break,
                // The next message is larger than our chunk; size up to it.
                Err(kcp::Error::UserBufTooSmall) => match self.kcp.peeksize() {
                    Ok(size) => chunk.resize(size, 0),
                    Err(_) => break,
                },
                Err(e) => {
                    error!("engine recv error: {}", e);
                    break;
                }
            }
        }
    }
}
