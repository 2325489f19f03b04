//! The supervisor: one task owning the whole client.
//!
//! [`Client::setup`] performs the startup sequence (UDP socket, upstream
//! resolution, conversation handshake, TCP listener), and [`Client::run`]
//! enters a single cooperative loop servicing the listener, every session's
//! events, the UDP socket, the engine update tick and the keepalive tick.
//! All mutable state (engine, connection table, reassembly buffer) lives in
//! [`Mux`] and is touched by this task alone; sessions interact with it
//! only through channels, addressed by connection index.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::Config;
use crate::frame::{self, Frame};
use crate::handshake;
use crate::session::{self, Event, SessionHandle, Timeouts};
use crate::table::ConnTable;
use crate::transport::Transport;

/// Engine driver period.
const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Keepalive control-frame period.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Grace period between `stop` and loop exit, long enough for the queued
/// close frames to be delivered reliably.
const DRAIN_PERIOD: Duration = Duration::from_secs(3);

/// Handshake retransmit period.
const HANDSHAKE_RESEND: Duration = Duration::from_secs(1);

/// Hard handshake budget; setup fails once it elapses.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive buffer for one UDP datagram; engine datagrams stay within its
/// MTU, far below this.
const DATAGRAM_BUF: usize = 2048;

/// Cloneable trigger for an orderly shutdown of a running [`Client`], the
/// programmatic equivalent of an interrupt signal.
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

/// A fully set-up tunnel client, ready to [`run`](Client::run).
pub struct Client {
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    events_rx: mpsc::Receiver<Event>,
    stop_rx: mpsc::Receiver<()>,
    stop_tx: mpsc::Sender<()>,
    mux: Mux,
}

impl Client {
    /// Startup sequence: open and connect the UDP socket, resolve the
    /// upstream host, negotiate the conversation id, bind the TCP
    /// listener.  Every failure here is fatal.
    pub async fn setup(config: &Config) -> Result<Self> {
        let upstream = resolve(&config.upstream_host, config.upstream_port)?;
        let local: IpAddr = if upstream.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let udp = UdpSocket::bind((local, 0)).await.context("create udp socket")?;
        udp.connect(upstream)
            .await
            .with_context(|| format!("connect udp socket to {upstream}"))?;

        // The conversation id is simply the current wall-clock second.
        let conv = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        info!("negotiating conversation {} with {}", conv, upstream);
        negotiate(&udp, conv).await?;
        info!("conversation {} accepted by server", conv);

        let listen_ip: IpAddr = config
            .listen_ip
            .parse()
            .with_context(|| format!("invalid listen ip: {}", config.listen_ip))?;
        let listener = TcpListener::bind((listen_ip, config.listen_port))
            .await
            .with_context(|| {
                format!("bind tcp listener on {}:{}", config.listen_ip, config.listen_port)
            })?;
        info!("listening on {}", listener.local_addr()?);

        let udp = Arc::new(udp);
        let (events_tx, events_rx) = mpsc::channel(128);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Ok(Self {
            listener,
            udp: Arc::clone(&udp),
            events_rx,
            stop_rx,
            stop_tx,
            mux: Mux {
                transport: Transport::new(conv, udp),
                conns: ConnTable::new(),
                stream_buf: BytesMut::new(),
                events_tx,
                timeouts: Timeouts::from_secs(config.tcp_read_timeout, config.tcp_write_timeout),
                conv,
                running: true,
            },
        })
    }

    /// Address the TCP listener is bound to.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that triggers the same orderly shutdown as an interrupt.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { tx: self.stop_tx.clone() }
    }

    /// The event loop.  Returns after an orderly shutdown has drained, or
    /// with an error on an unrecoverable fault.
    pub async fn run(self) -> Result<()> {
        let Client { listener, udp, mut events_rx, mut stop_rx, stop_tx, mut mux } = self;
        // Keep one sender alive so `stop_rx` only resolves on a real stop.
        let _stop_tx = stop_tx;

        let mut update_tick = time::interval_at(Instant::now() + UPDATE_INTERVAL, UPDATE_INTERVAL);
        update_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive_tick =
            time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut datagram = [0u8; DATAGRAM_BUF];
        let mut drain_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                accepted = listener.accept(), if mux.running => match accepted {
                    Ok((stream, peer)) => mux.on_accept(stream, peer),
                    Err(e) => warn!("accept failed: {}", e),
                },
                received = udp.recv(&mut datagram) => match received {
                    Ok(n) => {
                        mux.on_datagram(&datagram[..n])?;
                        mux.poke(&mut update_tick);
                    }
                    // Includes ICMP-reported faults on a connected socket;
                    // the engine keeps retransmitting regardless.
                    Err(e) => error!("udp recv error: {}", e),
                },
                event = events_rx.recv() => {
                    if let Some(event) = event {
                        mux.on_event(event)?;
                        mux.poke(&mut update_tick);
                    }
                }
                _ = update_tick.tick() => mux.transport.update(),
                _ = keepalive_tick.tick(), if mux.running => {
                    mux.send_keepalive()?;
                    mux.poke(&mut update_tick);
                }
                _ = tokio::signal::ctrl_c(), if mux.running => {
                    info!("interrupt received");
                    mux.stop()?;
                    drain_deadline = Some(Instant::now() + DRAIN_PERIOD);
                    mux.poke(&mut update_tick);
                }
                _ = stop_rx.recv(), if mux.running => {
                    mux.stop()?;
                    drain_deadline = Some(Instant::now() + DRAIN_PERIOD);
                    mux.poke(&mut update_tick);
                }
                _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => break,
            }
        }

        info!("client closed");
        Ok(())
    }
}

/// Resolve the upstream host once, blocking; startup has no other I/O in
/// flight.  IPv4 results are preferred.
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve upstream host {host}"))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("no addresses for upstream host {host}"))
}

/// Announce `conv` once per second until the server echoes the datagram
/// verbatim; give up after [`HANDSHAKE_TIMEOUT`].
async fn negotiate(udp: &UdpSocket, conv: u32) -> Result<()> {
    let pkt = handshake::packet(conv);
    let mut resend = time::interval(HANDSHAKE_RESEND);
    let mut buf = [0u8; 64];

    let attempt = async {
        loop {
            tokio::select! {
                _ = resend.tick() => {
                    // Send faults here are transient (the server may not be
                    // up yet); the next tick retries.
                    if let Err(e) = udp.send(&pkt).await {
                        warn!("handshake send error: {}", e);
                    }
                }
                received = udp.recv(&mut buf) => match received {
                    Ok(n) if handshake::is_echo(&buf[..n], conv) => return,
                    Ok(n) => debug!("ignoring {} byte datagram during handshake", n),
                    Err(e) => debug!("udp recv during handshake: {}", e),
                },
            }
        }
    };

    if time::timeout(HANDSHAKE_TIMEOUT, attempt).await.is_err() {
        bail!(
            "server did not accept conversation {} within {:?}",
            conv,
            HANDSHAKE_TIMEOUT
        );
    }
    Ok(())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Multiplexer state, owned exclusively by the supervisor task.
struct Mux {
    transport: Transport,
    conns: ConnTable<SessionHandle>,
    /// Reassembly queue: stream bytes out of the engine awaiting framing.
    stream_buf: BytesMut,
    events_tx: mpsc::Sender<Event>,
    timeouts: Timeouts,
    conv: u32,
    running: bool,
}

impl Mux {
    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let events_tx = self.events_tx.clone();
        let timeouts = self.timeouts;
        match self.conns.accept(|idx| session::spawn(idx, stream, timeouts, events_tx)) {
            Some(idx) => info!("accepted {} as conn {}", peer, idx),
            None => error!("connection table full, dropping {}", peer),
        }
    }

    fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Data { idx, data } => self.on_tcp_bytes(idx, data),
            Event::Closed { idx } => self.remove_conn(idx, true),
        }
    }

    /// Forward bytes read from a local TCP peer, chunked into data frames.
    fn on_tcp_bytes(&mut self, idx: u16, data: Bytes) -> Result<()> {
        if self.conns.get(idx).is_none() {
            // The read was in flight while the index was removed.
            debug!("dropping {} bytes from removed conn {}", data.len(), idx);
            return Ok(());
        }
        for f in frame::data_frames(idx, &data) {
            self.send_frame(&f)?;
        }
        Ok(())
    }

    /// One datagram off the wire: filter handshake echoes, feed the engine,
    /// then decode every completed frame out of the reassembly queue.
    fn on_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        // The server echoes the handshake until it sees engine traffic;
        // duplicates must not reach the engine.
        if handshake::is_echo(datagram, self.conv) {
            debug!("discarding duplicate handshake echo");
            return Ok(());
        }
        if !self.transport.input(datagram) {
            return Ok(());
        }
        self.transport.drain_into(&mut self.stream_buf);
        while let Some(frame) = frame::try_decode(&mut self.stream_buf)
            .context("multiplexer stream desynchronized")?
        {
            self.dispatch(frame)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Data { idx, payload } => match self.conns.get(idx) {
                Some(handle) => {
                    debug!("stream recv({}): {} bytes", idx, payload.len());
                    if !handle.send(payload) {
                        debug!("conn {} is going away, payload dropped", idx);
                    }
                }
                None => {
                    // No such connection here; tell the server to drop it.
                    warn!("data frame for unknown conn {}, closing it", idx);
                    self.send_frame(&frame::encode_close(idx))?;
                }
            },
            Frame::Close { idx } => {
                if self.conns.get(idx).is_some() {
                    info!("server closed conn {}", idx);
                    self.remove_conn(idx, false)?;
                } else {
                    error!("close frame for unknown conn {}", idx);
                }
            }
            Frame::Keepalive => debug!("keepalive from server"),
            Frame::Unknown { ty } => error!("unknown control frame type {:#04x}", ty),
        }
        Ok(())
    }

    /// Drop `idx` from the table; announce it to the server unless the
    /// removal was the server's own doing.  A second remove is a no-op.
    fn remove_conn(&mut self, idx: u16, send_close: bool) -> Result<()> {
        let Some(handle) = self.conns.remove(idx) else {
            return Ok(());
        };
        if send_close {
            self.send_frame(&frame::encode_close(idx))?;
        }
        info!("removed conn {} ({} live)", idx, self.conns.len());
        // The session task delivers queued writes, then closes the socket.
        drop(handle);
        Ok(())
    }

    fn send_keepalive(&mut self) -> Result<()> {
        debug!("sending keepalive");
        self.send_frame(&frame::encode_keepalive())
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.transport.send(frame).context("engine rejected frame")
    }

    /// Advance the engine now and push the periodic tick back a full
    /// period, so injected bytes go out without waiting for the timer.
    fn poke(&mut self, update_tick: &mut time::Interval) {
        self.transport.update();
        update_tick.reset();
    }

    /// Orderly shutdown: stop accepting, close every connection announcing
    /// each to the server.  Idempotent.
    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        info!("stop tcp listener...");
        if !self.conns.is_empty() {
            let live: Vec<u16> = self.conns.indices().collect();
            info!("remove all tcp connections: {:?}", live);
            for (idx, handle) in self.conns.drain() {
                self.send_frame(&frame::encode_close(idx))?;
                drop(handle);
            }
        }
        info!("closing client in {:?}...", DRAIN_PERIOD);
        Ok(())
    }
}
