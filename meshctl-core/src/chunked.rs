// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C4 — Chunked Transfer.
//!
//! Fragments a payload too large for one frame (default budget 50 MiB) into
//! an ordered sequence of `ChunkPacket`s on the reserved
//! `channel_ids::CHUNKED_TRANSFER` channel, keyed by a session id. The
//! sender's `ChunkSplitter` is the pluggable analogue of the teacher's
//! `NetworkChannelsPacketSplitter`: broadcasting each chunk to a fixed set
//! of transport channels.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::transport::{
    channel_ids,
    codec::{encode_varint, TransportError},
    Frame, TransportChannel,
};

pub const DEFAULT_CHUNK_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChunkedTransferError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("out-of-order chunk for session {session_id}: expected index {expected}, got {got}")]
    OutOfOrder { session_id: Uuid, expected: u32, got: u32 },
    #[error("malformed chunk packet")]
    Malformed,
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPacket {
    pub session_id: Uuid,
    pub index: u32,
    pub is_last: bool,
    pub payload: Bytes,
}

impl ChunkPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + 5 + 1 + self.payload.len());
        buf.extend_from_slice(self.session_id.as_bytes());
        encode_varint(self.index as u64, &mut buf);
        buf.extend_from_slice(&[self.is_last as u8]);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, ChunkedTransferError> {
        if bytes.len() < 16 + 1 + 1 {
            return Err(ChunkedTransferError::Malformed);
        }
        let mut id_bytes = [0u8; 16];
        bytes.copy_to_slice(&mut id_bytes);
        let session_id = Uuid::from_bytes(id_bytes);

        let mut index: u64 = 0;
        let mut shift = 0;
        loop {
            if bytes.is_empty() {
                return Err(ChunkedTransferError::Malformed);
            }
            let byte = bytes.get_u8();
            index |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        if bytes.is_empty() {
            return Err(ChunkedTransferError::Malformed);
        }
        let is_last = bytes.get_u8() != 0;
        Ok(ChunkPacket { session_id, index: index as u32, is_last, payload: bytes })
    }

    pub fn into_frame(&self) -> Frame {
        Frame::new(channel_ids::CHUNKED_TRANSFER, self.encode())
    }
}

/// Broadcasts each chunk to a fixed set of transport channels, the
/// teacher's `NetworkChannelsPacketSplitter` equivalent.
#[async_trait]
pub trait ChunkSplitter: Send + Sync {
    async fn send_chunk(&self, chunk: &ChunkPacket) -> Result<(), ChunkedTransferError>;
}

pub struct BroadcastSplitter {
    channels: Vec<TransportChannel>,
}

impl BroadcastSplitter {
    pub fn new(channels: Vec<TransportChannel>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl ChunkSplitter for BroadcastSplitter {
    async fn send_chunk(&self, chunk: &ChunkPacket) -> Result<(), ChunkedTransferError> {
        for channel in &self.channels {
            // `send_frame_sync` blocks on a full outbound queue, which is
            // this layer's backpressure: a slow receiver cannot cause the
            // sender to buffer unboundedly in memory.
            channel.send_frame_sync(chunk.into_frame()).await?;
        }
        Ok(())
    }
}

/// Reads `reader` to completion, splitting it into `chunk_size`-byte
/// `ChunkPacket`s and handing each to `splitter` in order. Returns the
/// generated session id.
pub async fn send_stream<R>(mut reader: R, chunk_size: usize, splitter: &dyn ChunkSplitter) -> Result<Uuid, ChunkedTransferError>
where
    R: AsyncRead + Unpin,
{
    let session_id = Uuid::new_v4();
    let mut index = 0u32;
    let mut buf = vec![0u8; chunk_size];
    let mut pending: Option<Bytes> = None;

    loop {
        let n = read_full(&mut reader, &mut buf).await?;
        let chunk_bytes = Bytes::copy_from_slice(&buf[..n]);
        if let Some(prev) = pending.take() {
            splitter
                .send_chunk(&ChunkPacket { session_id, index, is_last: false, payload: prev })
                .await?;
            index += 1;
        }
        if n < chunk_size {
            splitter
                .send_chunk(&ChunkPacket { session_id, index, is_last: true, payload: chunk_bytes })
                .await?;
            return Ok(session_id);
        }
        pending = Some(chunk_bytes);
    }
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Called once a session completes successfully, with the path of the
/// assembled staging file.
pub type CompletionCallback = Box<dyn FnOnce(PathBuf) + Send>;

struct Session {
    file: tokio::fs::File,
    path: PathBuf,
    next_index: u32,
    on_complete: Option<CompletionCallback>,
}

/// Receives chunk packets, reassembling them into staging files under a
/// process temp directory, keyed by session id.
#[derive(Clone)]
pub struct ChunkReceiver {
    staging_dir: PathBuf,
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl ChunkReceiver {
    pub fn new(staging_dir: PathBuf) -> Self {
        Self { staging_dir, sessions: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Registers a completion callback to be invoked once `session_id`'s
    /// last chunk has been written; must be called before (or with) the
    /// first chunk for that session, i.e. on `ChunkedPacketSessionOpenEvent`.
    pub async fn open_session(&self, session_id: Uuid, on_complete: CompletionCallback) -> Result<(), ChunkedTransferError> {
        let path = self.staging_dir.join(session_id.to_string());
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let file = tokio::fs::File::create(&path).await?;
        self.sessions
            .lock()
            .expect("chunk session lock poisoned")
            .insert(session_id, Session { file, path, next_index: 0, on_complete: Some(on_complete) });
        Ok(())
    }

    /// Feeds one decoded chunk packet in. On `is_last`, closes the file and
    /// fires the completion callback.
    pub async fn handle_chunk(&self, chunk: ChunkPacket) -> Result<(), ChunkedTransferError> {
        let (mut file, is_last) = {
            let mut sessions = self.sessions.lock().expect("chunk session lock poisoned");
            let session = sessions
                .get_mut(&chunk.session_id)
                .ok_or(ChunkedTransferError::UnknownSession(chunk.session_id))?;
            if chunk.index != session.next_index {
                let expected = session.next_index;
                sessions.remove(&chunk.session_id);
                return Err(ChunkedTransferError::OutOfOrder { session_id: chunk.session_id, expected, got: chunk.index });
            }
            session.next_index += 1;
            (session.file.try_clone().await?, chunk.is_last)
        };
        file.write_all(&chunk.payload).await?;
        file.flush().await?;

        if is_last {
            let mut sessions = self.sessions.lock().expect("chunk session lock poisoned");
            if let Some(mut session) = sessions.remove(&chunk.session_id) {
                drop(sessions);
                session.file.shutdown().await.ok();
                if let Some(cb) = session.on_complete.take() {
                    cb(session.path);
                }
            }
        }
        Ok(())
    }

    pub fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.staging_dir.join(session_id.to_string())
    }
}

pub fn default_staging_dir(process_temp_dir: &Path) -> PathBuf {
    process_temp_dir.join("chunked-transfer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CollectingSplitter {
        sent: Mutex<Vec<ChunkPacket>>,
    }

    #[async_trait]
    impl ChunkSplitter for CollectingSplitter {
        async fn send_chunk(&self, chunk: &ChunkPacket) -> Result<(), ChunkedTransferError> {
            self.sent.lock().unwrap().push(chunk.clone());
            Ok(())
        }
    }

    #[test]
    fn chunk_packet_round_trips_through_encoding() {
        let chunk = ChunkPacket { session_id: Uuid::new_v4(), index: 7, is_last: true, payload: Bytes::from_static(b"data") };
        let decoded = ChunkPacket::decode(chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[tokio::test]
    async fn splits_a_stream_into_expected_chunk_count() {
        // 120 MiB source at 50 MiB chunks -> 3 chunks, last flagged (scenario 3, §8).
        let total = 120 * 1024 * 1024;
        let data = vec![7u8; total];
        let splitter = CollectingSplitter { sent: Mutex::new(Vec::new()) };
        send_stream(&data[..], DEFAULT_CHUNK_SIZE, &splitter).await.unwrap();
        let sent = splitter.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(!sent[0].is_last);
        assert!(!sent[1].is_last);
        assert!(sent[2].is_last);
        let reassembled: usize = sent.iter().map(|c| c.payload.len()).sum();
        assert_eq!(reassembled, total);
    }

    #[tokio::test]
    async fn receiver_reassembles_chunks_bytewise_identical() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = ChunkReceiver::new(dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        receiver
            .open_session(session_id, Box::new(move |_path| {
                done2.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        receiver
            .handle_chunk(ChunkPacket { session_id, index: 0, is_last: false, payload: Bytes::from_static(b"hello ") })
            .await
            .unwrap();
        receiver
            .handle_chunk(ChunkPacket { session_id, index: 1, is_last: true, payload: Bytes::from_static(b"world") })
            .await
            .unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 1);
        let contents = tokio::fs::read(receiver.path_for(session_id)).await.unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn out_of_order_chunk_fails_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = ChunkReceiver::new(dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        receiver.open_session(session_id, Box::new(|_| {})).await.unwrap();

        let result = receiver
            .handle_chunk(ChunkPacket { session_id, index: 1, is_last: false, payload: Bytes::new() })
            .await;
        assert!(matches!(result, Err(ChunkedTransferError::OutOfOrder { .. })));
    }
}
