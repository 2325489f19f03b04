//! Per-connection TCP session task.
//!
//! Every accepted connection gets one task that owns the `TcpStream` and
//! nothing else.  Bytes read from the peer go to the supervisor as
//! [`Event::Data`]; bytes from the server arrive over an unbounded channel
//! held by the supervisor's [`SessionHandle`].  The task ends in one of two
//! ways:
//!
//! - locally (EOF, I/O error, read or write timeout): it reports
//!   [`Event::Closed`] so the supervisor removes the entry and announces
//!   the close to the server;
//! - remotely: the supervisor drops the handle, the task delivers whatever
//!   writes were already queued, then exits silently.
//!
//! Either way the socket closes when the task returns.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, error::Elapsed};

/// Target size of one TCP read.
const READ_CHUNK: usize = 8 * 1024;

/// Per-direction inactivity limits; `None` disables that direction.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl Timeouts {
    /// Build from configured second counts, 0 disabling a direction.
    pub fn from_secs(read: u32, write: u32) -> Self {
        let limit = |secs: u32| (secs > 0).then(|| Duration::from_secs(secs.into()));
        Self { read: limit(read), write: limit(write) }
    }
}

/// Messages from session tasks to the supervisor.
#[derive(Debug)]
pub enum Event {
    /// Bytes read from the local TCP peer; never empty.
    Data { idx: u16, data: Bytes },
    /// The session ended locally and its index must be removed.
    Closed { idx: u16 },
}

/// Supervisor-side handle to one session.  Dropping it asks the task to
/// finish queued writes and close the socket.
pub struct SessionHandle {
    data_tx: mpsc::UnboundedSender<Bytes>,
}

impl SessionHandle {
    /// Queue bytes for delivery to the local TCP peer.  Returns false once
    /// the task has already exited.
    pub fn send(&self, data: Bytes) -> bool {
        self.data_tx.send(data).is_ok()
    }
}

/// Spawn the I/O task for one accepted connection.
pub fn spawn(
    idx: u16,
    stream: TcpStream,
    timeouts: Timeouts,
    events_tx: mpsc::Sender<Event>,
) -> SessionHandle {
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(idx, stream, timeouts, data_rx, events_tx));
    SessionHandle { data_tx }
}

async fn run(
    idx: u16,
    stream: TcpStream,
    timeouts: Timeouts,
    mut data_rx: mpsc::UnboundedReceiver<Bytes>,
    events_tx: mpsc::Sender<Event>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            queued = data_rx.recv() => match queued {
                Some(data) => {
                    match deadline(timeouts.write, wr.write_all(&data)).await {
                        Ok(Ok(())) => debug!("tcp send({}): {} bytes", idx, data.len()),
                        Ok(Err(e)) => {
                            info!("conn {} write error: {}", idx, e);
                            break;
                        }
                        Err(_) => {
                            info!("conn {} write timeout", idx);
                            break;
                        }
                    }
                }
                // Handle dropped by the supervisor: every queued write has
                // been delivered, close without reporting back.
                None => return,
            },
            read = deadline(timeouts.read, read_some(&mut rd, &mut read_buf)) => match read {
                Ok(Ok(0)) => {
                    info!("conn {} closed by tcp peer", idx);
                    break;
                }
                Ok(Ok(n)) => {
                    debug!("tcp recv({}): {} bytes", idx, n);
                    let data = read_buf.split().freeze();
                    if events_tx.send(Event::Data { idx, data }).await.is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    info!("conn {} read error: {}", idx, e);
                    break;
                }
                Err(_) => {
                    info!("conn {} read timeout", idx);
                    break;
                }
            },
        }
    }

    let _ = events_tx.send(Event::Closed { idx }).await;
}

async fn read_some(rd: &mut OwnedReadHalf, buf: &mut BytesMut) -> io::Result<usize> {
    buf.reserve(READ_CHUNK);
    rd.read_buf(buf).await
}

async fn deadline<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, Elapsed> {
    match limit {
        Some(d) => time::timeout(d, fut).await,
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_seconds_disables_a_direction() {
        let t = Timeouts::from_secs(0, 30);
        assert_eq!(t.read, None);
        assert_eq!(t.write, Some(Duration::from_secs(30)));

        let t = Timeouts::from_secs(5, 0);
        assert_eq!(t.read, Some(Duration::from_secs(5)));
        assert_eq!(t.write, None);
    }

    #[tokio::test]
    async fn eof_reports_closed_after_pending_data() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _handle = spawn(7, accepted, Timeouts::from_secs(0, 0), events_tx);

        peer.write_all(b"payload").await.unwrap();
        peer.shutdown().await.unwrap();

        // Reads may arrive in one or several chunks; the close always
        // follows the last of them.
        let mut collected = Vec::new();
        loop {
            match events_rx.recv().await.unwrap() {
                Event::Data { idx, data } => {
                    assert_eq!(idx, 7);
                    assert!(!data.is_empty());
                    collected.extend_from_slice(&data);
                }
                Event::Closed { idx } => {
                    assert_eq!(idx, 7);
                    break;
                }
            }
        }
        assert_eq!(collected, b"payload");
    }

    #[tokio::test]
    async fn dropping_the_handle_delivers_queued_writes_then_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let handle = spawn(2, accepted, Timeouts::from_secs(0, 0), events_tx);

        assert!(handle.send(Bytes::from_static(b"wo")));
        drop(handle);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"wo");

        // A remote-initiated teardown must not produce a Closed event.
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_timeout_reports_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _peer = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let timeouts = Timeouts { read: Some(Duration::from_millis(50)), write: None };
        let _handle = spawn(3, accepted, timeouts, events_tx);

        let event = time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("timeout should fire well before two seconds")
            .unwrap();
        assert!(matches!(event, Event::Closed { idx: 3 }));
    }
}
