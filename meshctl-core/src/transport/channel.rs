// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C3 — Transport Channels.
//!
//! One [`TransportChannel`] wraps a single bi-directional byte stream (a
//! `TcpStream` in production, anything `AsyncRead + AsyncWrite` in tests)
//! framed with [`FrameCodec`]. Frames arriving on the stream are demuxed by
//! their `channel_id` through a listener table: components register for a
//! channel id and receive every frame addressed to it. This is the
//! application-level substitute for the teacher's yamux substreams (see
//! `DESIGN.md`): the spec's wire format multiplexes in-band rather than
//! opening one transport stream per logical channel.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot, Notify},
};
use tokio_util::codec::Framed;

use super::codec::{Frame, FrameCodec, TransportError};

struct OutboundItem {
    frame: Frame,
    ack: Option<oneshot::Sender<Result<(), TransportError>>>,
}

type ListenerTable = Arc<RwLock<HashMap<u32, mpsc::UnboundedSender<Frame>>>>;

/// A single physical connection, demuxed into logical channels.
#[derive(Clone)]
pub struct TransportChannel {
    remote_addr: SocketAddr,
    outbound_tx: mpsc::Sender<OutboundItem>,
    listeners: ListenerTable,
    closed: Arc<AtomicBool>,
    close_notified: Arc<Notify>,
}

/// Outbound queue depth. Once full, `send_frame*` await-blocks the caller,
/// which is this layer's substitute for a raw socket writability signal
/// (§4.6 "the sender must block on the outbound buffer when the transport
/// reports not-writable").
const OUTBOUND_QUEUE_DEPTH: usize = 64;

impl TransportChannel {
    pub fn spawn<S>(stream: S, remote_addr: SocketAddr, on_close: impl FnOnce() + Send + 'static) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(stream, FrameCodec);
        let (mut sink, mut source) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundItem>(OUTBOUND_QUEUE_DEPTH);
        let listeners: ListenerTable = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let close_notified = Arc::new(Notify::new());

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let result = sink.send(item.frame).await;
                let failed = result.is_err();
                if let Some(ack) = item.ack {
                    let _ = ack.send(result);
                }
                if failed {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        let reader_listeners = listeners.clone();
        let reader_closed = closed.clone();
        let reader_notify = close_notified.clone();
        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                match next {
                    Ok(frame) => {
                        let sender = reader_listeners.read().expect("listener lock poisoned").get(&frame.channel_id).cloned();
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            },
                            None => {
                                log::debug!("dropping frame on channel {} with no registered listener", frame.channel_id);
                            },
                        }
                    },
                    Err(e) => {
                        log::warn!("transport channel to {} closed: {}", remote_addr, e);
                        break;
                    },
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            reader_notify.notify_waiters();
            on_close();
        });

        Self { remote_addr, outbound_tx, listeners, closed, close_notified }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn closed(&self) {
        if !self.is_closed() {
            self.close_notified.notified().await;
        }
    }

    /// Registers a receiver for `channel_id`. A second registration for the
    /// same id replaces the first (the old receiver simply stops getting
    /// frames).
    pub fn register_listener(&self, channel_id: u32) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.write().expect("listener lock poisoned").insert(channel_id, tx);
        rx
    }

    pub fn unregister_listener(&self, channel_id: u32) {
        self.listeners.write().expect("listener lock poisoned").remove(&channel_id);
    }

    /// Enqueues `frame` and awaits confirmation that it has been flushed to
    /// the wire before returning (§4.5 `sendSync`).
    pub async fn send_frame_sync(&self, frame: Frame) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound_tx
            .send(OutboundItem { frame, ack: Some(ack_tx) })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        ack_rx.await.map_err(|_| TransportError::ChannelClosed)?
    }

    /// Enqueues `frame` and returns a future the caller may await for
    /// completion, without blocking on it here (§4.5 asynchronous send).
    pub fn send_frame_async(&self, frame: Frame) -> oneshot::Receiver<Result<(), TransportError>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let outbound_tx = self.outbound_tx.clone();
        tokio::spawn(async move {
            if outbound_tx.send(OutboundItem { frame, ack: Some(ack_tx) }).await.is_err() {
                // Receiver already dropped with the queue; nothing to acknowledge.
            }
        });
        ack_rx
    }

    /// Fire-and-forget send with no flush confirmation; still subject to
    /// outbound backpressure.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound_tx
            .send(OutboundItem { frame, ack: None })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Dials `addr` and wraps the resulting TCP stream as a [`TransportChannel`].
pub async fn dial(addr: SocketAddr, on_close: impl FnOnce() + Send + 'static) -> Result<TransportChannel, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    Ok(TransportChannel::spawn(stream, addr, on_close))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::channel_ids;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TransportChannel, TransportChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_fut = TcpStream::connect(addr);
        let (server_stream, client_stream) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { client_fut.await.unwrap() }
        );
        let server = TransportChannel::spawn(server_stream, addr, || {});
        let client = TransportChannel::spawn(client_stream, addr, || {});
        (client, server)
    }

    #[tokio::test]
    async fn frame_sent_on_one_side_is_delivered_to_the_registered_listener() {
        let (client, server) = connected_pair().await;
        let mut rx = server.register_listener(channel_ids::CHANNEL_MESSAGE);
        client
            .send_frame_sync(Frame::new(channel_ids::CHANNEL_MESSAGE, Bytes::from_static(b"hi")))
            .await
            .unwrap();
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn frame_with_no_listener_is_dropped_not_errored() {
        let (client, _server) = connected_pair().await;
        let result = client.send_frame_sync(Frame::new(99, Bytes::from_static(b"nobody home"))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn send_order_is_preserved_per_channel() {
        let (client, server) = connected_pair().await;
        let mut rx = server.register_listener(channel_ids::CHANNEL_MESSAGE);
        for i in 0..10u64 {
            client
                .send_frame_sync(Frame::with_packet_id(channel_ids::CHANNEL_MESSAGE, i, Bytes::new()))
                .await
                .unwrap();
        }
        for expected in 0..10u64 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.packet_unique_id, expected);
        }
    }

    #[tokio::test]
    async fn closing_the_peer_marks_the_channel_closed() {
        let (client, server) = connected_pair().await;
        drop(server);
        // Give the reader task a moment to observe EOF.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), client.closed()).await;
        assert!(client.is_closed());
    }
}
