/*
 * mux.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * This file is part of Yggmail, a peer-to-peer mail server.
 *
 * Yggmail is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Yggmail is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Yggmail.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Stream multiplexer over one reliable encrypted connection. Frames carry
//! a stream id, a type and a 16-bit length; streams are credit-windowed so
//! one slow receiver cannot balloon memory. Dial-side streams use odd ids,
//! accept-side even ids.
//!
//! Frame layout: u32 stream id | u8 type | u16 payload length | payload.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

// Frame types
pub const TYPE_DATA: u8 = 0x0;
pub const TYPE_OPEN: u8 = 0x1;
pub const TYPE_CLOSE: u8 = 0x2;
pub const TYPE_RESET: u8 = 0x3;
pub const TYPE_WINDOW_UPDATE: u8 = 0x4;
pub const TYPE_GOAWAY: u8 = 0x5;

pub const FRAME_HEADER_LENGTH: usize = 7;
pub const MAX_FRAME_PAYLOAD: usize = 16384;

/// Bytes a sender may have in flight per stream before the receiver
/// acknowledges delivery with WINDOW_UPDATE.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Idle period after which the whole session is torn down.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_QUEUE_DEPTH: usize = 64;
const FRAME_QUEUE_DEPTH: usize = 64;
const STREAM_BUFFER: usize = 64 * 1024;

/// Which side of the connection we are; decides stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

#[derive(Debug)]
struct Frame {
    stream: u32,
    kind: u8,
    payload: Bytes,
}

impl Frame {
    fn control(stream: u32, kind: u8) -> Self {
        Self {
            stream,
            kind,
            payload: Bytes::new(),
        }
    }

    fn data(stream: u32, payload: Bytes) -> Self {
        Self {
            stream,
            kind: TYPE_DATA,
            payload,
        }
    }

    fn window_update(stream: u32, credit: u32) -> Self {
        Self {
            stream,
            kind: TYPE_WINDOW_UPDATE,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }
}

enum StreamEvent {
    Data(Bytes),
    Eof,
    Reset,
}

/// Outbound credit for one stream.
struct Credit {
    available: Mutex<u32>,
    notify: Notify,
    dead: AtomicBool,
}

impl Credit {
    fn new(initial: u32) -> Self {
        Self {
            available: Mutex::new(initial),
            notify: Notify::new(),
            dead: AtomicBool::new(false),
        }
    }

    /// Take up to `want` bytes of credit, waiting for a window update when
    /// none is available. None when the stream or session died.
    async fn acquire(&self, want: usize) -> Option<usize> {
        loop {
            if self.dead.load(Ordering::Acquire) {
                return None;
            }
            {
                let mut available = self.available.lock().unwrap();
                if *available > 0 {
                    let take = (*available as usize).min(want);
                    *available -= take as u32;
                    return Some(take);
                }
            }
            self.notify.notified().await;
        }
    }

    fn add(&self, credit: u32) {
        let mut available = self.available.lock().unwrap();
        *available = available.saturating_add(credit);
        drop(available);
        self.notify.notify_one();
    }

    fn kill(&self) {
        self.dead.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct StreamState {
    event_tx: mpsc::Sender<StreamEvent>,
    credit: Arc<Credit>,
}

struct Shared {
    out_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, StreamState>>,
    next_id: AtomicU32,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn close(&self, reason: &str) {
        {
            let mut stored = self.close_reason.lock().unwrap();
            if stored.is_none() {
                *stored = Some(reason.to_string());
            }
        }
        self.closed.cancel();
        let mut streams = self.streams.lock().unwrap();
        for (_, state) in streams.drain() {
            let _ = state.event_tx.try_send(StreamEvent::Eof);
            state.credit.kill();
        }
    }
}

/// Handle to one multiplexed session.
#[derive(Clone)]
pub struct MuxConnection {
    shared: Arc<Shared>,
}

impl MuxConnection {
    /// Take ownership of the connection and start its reader, writer and
    /// idle-timeout tasks. Returns the handle plus the queue of streams the
    /// peer opens towards us.
    pub fn new<IO>(io: IO, role: Role) -> (Self, mpsc::Receiver<MuxStream>)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let shared = Arc::new(Shared {
            out_tx,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(match role {
                Role::Dialer => 1,
                Role::Acceptor => 2,
            }),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        });

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(writer_task(write_half, out_rx, shared.clone()));
        tokio::spawn(reader_task(read_half, shared.clone(), accept_tx));
        tokio::spawn(idle_task(shared.clone()));

        (Self { shared }, accept_rx)
    }

    /// Open a new stream towards the peer.
    pub async fn open_stream(&self) -> io::Result<MuxStream> {
        if self.is_closed() {
            return Err(closed_error(&self.shared));
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::SeqCst);
        let stream = register_stream(&self.shared, id);
        self.shared
            .out_tx
            .send(Frame::control(id, TYPE_OPEN))
            .await
            .map_err(|_| closed_error(&self.shared))?;
        Ok(stream)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Tear the session down, failing all of its streams.
    pub fn close(&self, reason: &str) {
        self.shared.close(reason);
    }

    /// Resolves when the session is gone, however it went.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

fn closed_error(shared: &Shared) -> io::Error {
    let reason = shared
        .close_reason
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| "session closed".to_string());
    io::Error::new(io::ErrorKind::BrokenPipe, reason)
}

/// Create the stream pair for `id` and insert its state. The pump task
/// turns application writes into DATA frames, honouring the send window.
fn register_stream(shared: &Arc<Shared>, id: u32) -> MuxStream {
    let (app_io, pump_io) = tokio::io::duplex(STREAM_BUFFER);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let credit = Arc::new(Credit::new(INITIAL_WINDOW));
    shared.streams.lock().unwrap().insert(
        id,
        StreamState {
            event_tx,
            credit: credit.clone(),
        },
    );
    tokio::spawn(pump_task(pump_io, shared.clone(), id, credit));
    MuxStream {
        id,
        app_io,
        event_rx,
        read_buf: Bytes::new(),
        eof: false,
    }
}

/// Read application bytes out of the duplex pipe and frame them.
async fn pump_task(mut pump_io: DuplexStream, shared: Arc<Shared>, id: u32, credit: Arc<Credit>) {
    let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
    loop {
        let n = match pump_io.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut offset = 0;
        while offset < n {
            let Some(take) = credit.acquire(n - offset).await else {
                return;
            };
            let chunk = Bytes::copy_from_slice(&buf[offset..offset + take]);
            if shared.out_tx.send(Frame::data(id, chunk)).await.is_err() {
                return;
            }
            offset += take;
        }
    }
    // Application side finished writing: half-close towards the peer.
    let _ = shared.out_tx.send(Frame::control(id, TYPE_CLOSE)).await;
}

async fn writer_task<W>(mut writer: W, mut out_rx: mpsc::Receiver<Frame>, shared: Arc<Shared>)
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shared.closed.cancelled() => break,
        };
        let mut header = [0u8; FRAME_HEADER_LENGTH];
        header[..4].copy_from_slice(&frame.stream.to_be_bytes());
        header[4] = frame.kind;
        header[5..7].copy_from_slice(&(frame.payload.len() as u16).to_be_bytes());
        if writer.write_all(&header).await.is_err()
            || writer.write_all(&frame.payload).await.is_err()
            || writer.flush().await.is_err()
        {
            shared.close("write failed");
            break;
        }
        shared.touch();
    }
    let _ = writer.shutdown().await;
}

async fn reader_task<R>(mut reader: R, shared: Arc<Shared>, accept_tx: mpsc::Sender<MuxStream>)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let mut header = [0u8; FRAME_HEADER_LENGTH];
        if reader.read_exact(&mut header).await.is_err() {
            shared.close("connection lost");
            return;
        }
        let stream_id = u32::from_be_bytes(header[..4].try_into().unwrap());
        let kind = header[4];
        let length = u16::from_be_bytes(header[5..7].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; length];
        if length > 0 && reader.read_exact(&mut payload).await.is_err() {
            shared.close("connection lost");
            return;
        }
        shared.touch();

        match kind {
            TYPE_OPEN => {
                let exists = shared.streams.lock().unwrap().contains_key(&stream_id);
                if exists {
                    let _ = shared
                        .out_tx
                        .send(Frame::control(stream_id, TYPE_RESET))
                        .await;
                    continue;
                }
                let stream = register_stream(&shared, stream_id);
                if accept_tx.send(stream).await.is_err() {
                    remove_stream(&shared, stream_id);
                    let _ = shared
                        .out_tx
                        .send(Frame::control(stream_id, TYPE_RESET))
                        .await;
                }
            }
            TYPE_DATA => {
                let event_tx = {
                    let streams = shared.streams.lock().unwrap();
                    streams.get(&stream_id).map(|s| s.event_tx.clone())
                };
                let Some(event_tx) = event_tx else {
                    continue;
                };
                let length = payload.len() as u32;
                if event_tx
                    .send(StreamEvent::Data(Bytes::from(payload)))
                    .await
                    .is_err()
                {
                    // Receiver dropped its stream without reading it dry.
                    remove_stream(&shared, stream_id);
                    let _ = shared
                        .out_tx
                        .send(Frame::control(stream_id, TYPE_RESET))
                        .await;
                    continue;
                }
                // Delivered: hand the credit straight back.
                let _ = shared
                    .out_tx
                    .send(Frame::window_update(stream_id, length))
                    .await;
            }
            TYPE_WINDOW_UPDATE => {
                if payload.len() == 4 {
                    let credit = u32::from_be_bytes(payload[..4].try_into().unwrap());
                    let streams = shared.streams.lock().unwrap();
                    if let Some(state) = streams.get(&stream_id) {
                        state.credit.add(credit);
                    }
                }
            }
            TYPE_CLOSE => {
                let event_tx = {
                    let streams = shared.streams.lock().unwrap();
                    streams.get(&stream_id).map(|s| s.event_tx.clone())
                };
                if let Some(event_tx) = event_tx {
                    if event_tx.send(StreamEvent::Eof).await.is_err() {
                        // Both directions are done with this stream.
                        remove_stream(&shared, stream_id);
                    }
                }
            }
            TYPE_RESET => {
                if let Some(state) = remove_stream(&shared, stream_id) {
                    let _ = state.event_tx.try_send(StreamEvent::Reset);
                    state.credit.kill();
                }
            }
            TYPE_GOAWAY => {
                shared.close("peer went away");
                return;
            }
            _ => {
                shared.close("protocol error");
                return;
            }
        }
    }
}

fn remove_stream(shared: &Arc<Shared>, id: u32) -> Option<StreamState> {
    shared.streams.lock().unwrap().remove(&id)
}

async fn idle_task(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.closed.cancelled() => return,
        }
        let idle = shared.last_activity.lock().unwrap().elapsed();
        if idle > SESSION_IDLE_TIMEOUT {
            shared.close("idle timeout");
            return;
        }
    }
}

/// One multiplexed stream: reads arrive as DATA events, writes go through
/// an internal pipe drained by the pump task.
pub struct MuxStream {
    id: u32,
    app_io: DuplexStream,
    event_rx: mpsc::Receiver<StreamEvent>,
    read_buf: Bytes,
    eof: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let take = self.read_buf.len().min(buf.remaining());
                let chunk = self.read_buf.split_to(take);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }
            match self.event_rx.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Data(data))) => {
                    self.read_buf = data;
                }
                Poll::Ready(Some(StreamEvent::Eof)) | Poll::Ready(None) => {
                    self.eof = true;
                }
                Poll::Ready(Some(StreamEvent::Reset)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "stream reset by peer",
                    )));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.app_io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.app_io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.app_io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (
        (MuxConnection, mpsc::Receiver<MuxStream>),
        (MuxConnection, mpsc::Receiver<MuxStream>),
    ) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (
            MuxConnection::new(a, Role::Dialer),
            MuxConnection::new(b, Role::Acceptor),
        )
    }

    #[tokio::test]
    async fn open_and_exchange() {
        let ((dialer, _), (_acceptor, mut accept_rx)) = pair();
        let mut outbound = dialer.open_stream().await.unwrap();
        outbound.write_all(b"hello over mux").await.unwrap();
        outbound.flush().await.unwrap();

        let mut inbound = accept_rx.recv().await.unwrap();
        assert_eq!(inbound.id() % 2, 1);
        let mut buf = [0u8; 14];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over mux");

        // And the other direction on the same stream.
        inbound.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn shutdown_is_seen_as_eof() {
        let ((dialer, _), (_acceptor, mut accept_rx)) = pair();
        let mut outbound = dialer.open_stream().await.unwrap();
        outbound.write_all(b"bye").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut inbound = accept_rx.recv().await.unwrap();
        let mut all = Vec::new();
        inbound.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"bye");
    }

    #[tokio::test]
    async fn large_transfer_respects_windows() {
        let ((dialer, _), (_acceptor, mut accept_rx)) = pair();
        let mut outbound = dialer.open_stream().await.unwrap();
        let payload = vec![0x5a_u8; (INITIAL_WINDOW as usize) * 3];
        let expected = payload.len();

        let writer = tokio::spawn(async move {
            outbound.write_all(&payload).await.unwrap();
            outbound.shutdown().await.unwrap();
        });

        let mut inbound = accept_rx.recv().await.unwrap();
        let mut all = Vec::new();
        inbound.read_to_end(&mut all).await.unwrap();
        writer.await.unwrap();
        assert_eq!(all.len(), expected);
        assert!(all.iter().all(|&b| b == 0x5a));
    }

    #[tokio::test]
    async fn close_fails_open_streams() {
        let ((dialer, _), (_acceptor, _accept_rx)) = pair();
        let stream = dialer.open_stream().await.unwrap();
        dialer.close("replaced");
        assert!(dialer.is_closed());
        drop(stream);
        assert!(dialer.open_stream().await.is_err());
    }
}
