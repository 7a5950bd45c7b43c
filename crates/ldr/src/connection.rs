//! Framed duplex connection with sequence/acknowledgement tracking.
//!
//! Every outgoing frame carries the next sequence number (first = 0) and
//! acknowledges the last sequence number received (0xFFFF before anything
//! arrived). Incoming frames must be consecutive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use crate::bridge::codec::{CodecError, LdrCodec};
use crate::bridge::protocol::{FileChunk, Frame, Message};

/// Largest FileTransmission payload.
pub const FILE_CHUNK_LEN: usize = 64 * 1024;

const NOTHING_RECEIVED: u16 = 0xFFFF;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u16, got: u16 },
    #[error("connection closed")]
    Closed,
    #[error("{name}: file changed while sending ({sent} of {expected} bytes)")]
    FileChanged {
        name: String,
        sent: u64,
        expected: u64,
    },
    #[error("{name}: chunk at offset {offset} out of order, expected {expected}")]
    OutOfOrder {
        name: String,
        offset: u64,
        expected: u64,
    },
    #[error("{name}: chunk exceeds declared size {total_size}")]
    Oversized { name: String, total_size: u64 },
}

impl ConnectionError {
    /// True for malformed or out-of-sequence input, as opposed to transport failure.
    pub fn is_protocol(&self) -> bool {
        match self {
            Self::Codec(CodecError::Io(_)) => false,
            Self::Codec(_) | Self::SequenceGap { .. } => true,
            _ => false,
        }
    }
}

type FramedLdr<S> = Framed<S, LdrCodec>;

/// Last sequence number received, shared by both halves.
#[derive(Debug, Clone)]
struct AckCounter(Arc<AtomicU16>);

impl AckCounter {
    fn new() -> Self {
        Self(Arc::new(AtomicU16::new(NOTHING_RECEIVED)))
    }

    fn current(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }

    fn accept(&self, seq_no: u16) -> Result<(), ConnectionError> {
        let expected = self.current().wrapping_add(1);
        if seq_no != expected {
            return Err(ConnectionError::SequenceGap {
                expected,
                got: seq_no,
            });
        }
        self.0.store(seq_no, Ordering::Release);
        Ok(())
    }
}

/// Receiving half.
pub struct ConnectionReader<S> {
    stream: SplitStream<FramedLdr<S>>,
    acks: AckCounter,
}

impl<S> ConnectionReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next frame, or `None` on clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ConnectionError> {
        match self.stream.next().await {
            Some(Ok(frame)) => {
                self.acks.accept(frame.seq_no)?;
                Ok(Some(frame))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Sending half.
pub struct ConnectionWriter<S> {
    sink: SplitSink<FramedLdr<S>, Frame>,
    next_seq: u16,
    acks: AckCounter,
}

impl<S> ConnectionWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sequence number the next outgoing frame will carry.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    fn frame(&mut self, message: Message) -> Frame {
        let frame = Frame {
            seq_no: self.next_seq,
            ack_no: self.acks.current(),
            message,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        frame
    }

    /// Send one message and flush. Returns the sequence number used.
    pub async fn send(&mut self, message: Message) -> Result<u16, ConnectionError> {
        let frame = self.frame(message);
        let seq_no = frame.seq_no;
        self.sink.send(frame).await?;
        Ok(seq_no)
    }

    /// Stream `path` as FileTransmission chunks. A zero-length file is sent
    /// as one empty chunk.
    pub async fn copy_file(
        &mut self,
        frame_no: u32,
        name: &str,
        path: &Path,
    ) -> Result<u64, ConnectionError> {
        let mut file = tokio::fs::File::open(path).await?;
        let total_size = file.metadata().await?.len();
        let mut buf = vec![0u8; FILE_CHUNK_LEN];
        let mut offset = 0u64;

        loop {
            let want = (total_size - offset).min(FILE_CHUNK_LEN as u64) as usize;
            let mut filled = 0;
            while filled < want {
                let n = file.read(&mut buf[filled..want]).await?;
                if n == 0 {
                    return Err(ConnectionError::FileChanged {
                        name: name.to_string(),
                        sent: offset + filled as u64,
                        expected: total_size,
                    });
                }
                filled += n;
            }

            let chunk = FileChunk {
                frame_no,
                name: name.to_string(),
                total_size,
                offset,
                data: Bytes::copy_from_slice(&buf[..filled]),
            };
            let last = chunk.is_last();
            let frame = self.frame(Message::FileTransmission(chunk));
            self.sink.feed(frame).await?;
            offset += filled as u64;
            if last {
                break;
            }
        }

        self.sink.flush().await?;
        tracing::debug!(frame = frame_no, file = %name, bytes = total_size, "File sent");
        Ok(total_size)
    }

    /// Send EndOfStream and shut the write side down.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        let frame = self.frame(Message::EndOfStream);
        self.sink.send(frame).await?;
        self.sink.close().await?;
        Ok(())
    }
}

/// A framed LDR connection over any byte stream.
pub struct Connection<S> {
    reader: ConnectionReader<S>,
    writer: ConnectionWriter<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_codec(stream, LdrCodec::new())
    }

    pub fn with_codec(stream: S, codec: LdrCodec) -> Self {
        let (sink, stream) = Framed::new(stream, codec).split();
        let acks = AckCounter::new();
        Self {
            reader: ConnectionReader {
                stream,
                acks: acks.clone(),
            },
            writer: ConnectionWriter {
                sink,
                next_seq: 0,
                acks,
            },
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<u16, ConnectionError> {
        self.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>, ConnectionError> {
        self.reader.recv().await
    }

    /// Like `recv`, but end of stream is an error.
    pub async fn recv_required(&mut self) -> Result<Frame, ConnectionError> {
        self.recv().await?.ok_or(ConnectionError::Closed)
    }

    pub async fn copy_file(
        &mut self,
        frame_no: u32,
        name: &str,
        path: &Path,
    ) -> Result<u64, ConnectionError> {
        self.writer.copy_file(frame_no, name, path).await
    }

    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        self.writer.close().await
    }

    pub fn split(self) -> (ConnectionReader<S>, ConnectionWriter<S>) {
        (self.reader, self.writer)
    }
}

/// Receiving end of a file transfer, writing chunks in offset order.
pub struct FileSink {
    name: String,
    path: PathBuf,
    file: tokio::fs::File,
    total_size: u64,
    written: u64,
}

impl FileSink {
    pub async fn create(
        path: PathBuf,
        name: impl Into<String>,
        total_size: u64,
    ) -> Result<Self, ConnectionError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            name: name.into(),
            path,
            file,
            total_size,
            written: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.total_size
    }

    /// Append one chunk. Returns true once the file is complete.
    pub async fn write_chunk(&mut self, chunk: &FileChunk) -> Result<bool, ConnectionError> {
        if chunk.offset != self.written {
            return Err(ConnectionError::OutOfOrder {
                name: self.name.clone(),
                offset: chunk.offset,
                expected: self.written,
            });
        }
        let end = chunk.offset + chunk.data.len() as u64;
        if end > self.total_size || chunk.total_size != self.total_size {
            return Err(ConnectionError::Oversized {
                name: self.name.clone(),
                total_size: self.total_size,
            });
        }
        self.file.write_all(&chunk.data).await?;
        self.written = end;
        Ok(self.is_complete())
    }

    /// Flush, stamp the modification time and close.
    pub async fn finish(mut self, mtime_ms: u64) -> Result<PathBuf, ConnectionError> {
        self.file.flush().await?;
        let file = self.file.into_std().await;
        let mtime = UNIX_EPOCH + Duration::from_millis(mtime_ms);
        tokio::task::spawn_blocking(move || {
            file.set_modified(mtime)?;
            file.sync_all()
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{SpecialRequest, TaskStateKind};

    fn pair() -> (
        Connection<tokio::io::DuplexStream>,
        Connection<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (Connection::new(a), Connection::new(b))
    }

    #[tokio::test]
    async fn seq_and_ack_progress() {
        let (mut server, mut client) = pair();

        assert_eq!(server.send(Message::EndOfStream).await.unwrap(), 0);
        let first = client.recv_required().await.unwrap();
        assert_eq!(first.seq_no, 0);
        assert_eq!(first.ack_no, 0xFFFF);

        let seq = client
            .send(Message::TaskState {
                frame_no: 1,
                state: TaskStateKind::Rendering,
            })
            .await
            .unwrap();
        assert_eq!(seq, 0);
        let reply = server.recv_required().await.unwrap();
        assert_eq!(reply.seq_no, 0);
        assert_eq!(reply.ack_no, 0);

        server
            .send(Message::SpecialTaskRequest {
                frame_no: 1,
                request: SpecialRequest::Stop,
            })
            .await
            .unwrap();
        let second = client.recv_required().await.unwrap();
        assert_eq!(second.seq_no, 1);
        assert_eq!(second.ack_no, 0);
    }

    #[tokio::test]
    async fn sequence_gap_is_protocol_error() {
        let (a, b) = tokio::io::duplex(4096);
        let mut raw = Framed::new(a, LdrCodec::new());
        let mut conn = Connection::new(b);

        raw.send(Frame {
            seq_no: 0,
            ack_no: 0xFFFF,
            message: Message::EndOfStream,
        })
        .await
        .unwrap();
        raw.send(Frame {
            seq_no: 2,
            ack_no: 0xFFFF,
            message: Message::EndOfStream,
        })
        .await
        .unwrap();

        conn.recv_required().await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::SequenceGap {
                expected: 1,
                got: 2
            }
        ));
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn first_frame_must_be_zero() {
        let (a, b) = tokio::io::duplex(4096);
        let mut raw = Framed::new(a, LdrCodec::new());
        let mut conn = Connection::new(b);
        raw.send(Frame {
            seq_no: 5,
            ack_no: 0xFFFF,
            message: Message::EndOfStream,
        })
        .await
        .unwrap();
        assert!(matches!(
            conn.recv().await.unwrap_err(),
            ConnectionError::SequenceGap {
                expected: 0,
                got: 5
            }
        ));
    }

    #[tokio::test]
    async fn eof_is_none() {
        let (a, b) = tokio::io::duplex(64);
        let mut conn = Connection::new(b);
        drop(a);
        assert!(conn.recv().await.unwrap().is_none());

        let (c, d) = tokio::io::duplex(64);
        drop(c);
        let mut conn = Connection::new(d);
        assert!(matches!(
            conn.recv_required().await.unwrap_err(),
            ConnectionError::Closed
        ));
    }

    #[tokio::test]
    async fn split_halves_share_ack_counter() {
        let (server, mut client) = pair();
        let (mut reader, mut writer) = server.split();

        client.send(Message::EndOfStream).await.unwrap();
        client.send(Message::EndOfStream).await.unwrap();
        reader.recv().await.unwrap().unwrap();
        reader.recv().await.unwrap().unwrap();

        assert_eq!(writer.next_seq(), 0);
        writer.send(Message::EndOfStream).await.unwrap();
        let frame = client.recv_required().await.unwrap();
        assert_eq!(frame.ack_no, 1);
        assert_eq!(writer.next_seq(), 1);
    }

    #[tokio::test]
    async fn copy_file_streams_chunks_into_sink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");
        let content: Vec<u8> = (0..(FILE_CHUNK_LEN * 2 + 100))
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(&src, &content).unwrap();

        let (mut server, mut client) = pair();
        let send = tokio::spawn(async move {
            server.copy_file(4, "big.bin", &src).await.unwrap();
            server
        });

        let dest = dir.path().join("out/big.bin");
        let mut sink = FileSink::create(dest.clone(), "big.bin", content.len() as u64)
            .await
            .unwrap();
        let mut chunks = 0;
        loop {
            let frame = client.recv_required().await.unwrap();
            let Message::FileTransmission(chunk) = frame.message else {
                panic!("expected file chunk");
            };
            assert_eq!(chunk.frame_no, 4);
            assert!(chunk.data.len() <= FILE_CHUNK_LEN);
            chunks += 1;
            if sink.write_chunk(&chunk).await.unwrap() {
                break;
            }
        }
        send.await.unwrap();

        assert_eq!(chunks, 3);
        let path = sink.finish(1_600_000_000_000).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), content);
        let mtime = std::fs::metadata(&path)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        assert_eq!(mtime, 1_600_000_000_000);
    }

    #[tokio::test]
    async fn empty_file_is_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty.inc");
        std::fs::write(&src, b"").unwrap();

        let (mut server, mut client) = pair();
        server.copy_file(1, "empty.inc", &src).await.unwrap();

        let frame = client.recv_required().await.unwrap();
        let Message::FileTransmission(chunk) = frame.message else {
            panic!("expected file chunk");
        };
        assert_eq!(chunk.total_size, 0);
        assert!(chunk.data.is_empty());
        assert!(chunk.is_last());
    }

    #[tokio::test]
    async fn sink_rejects_out_of_order_and_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create(dir.path().join("f"), "f", 4).await.unwrap();

        let skipped = FileChunk {
            frame_no: 1,
            name: "f".to_string(),
            total_size: 4,
            offset: 2,
            data: Bytes::from_static(b"ab"),
        };
        assert!(matches!(
            sink.write_chunk(&skipped).await.unwrap_err(),
            ConnectionError::OutOfOrder { expected: 0, .. }
        ));

        let too_big = FileChunk {
            offset: 0,
            data: Bytes::from_static(b"abcde"),
            ..skipped
        };
        assert!(matches!(
            sink.write_chunk(&too_big).await.unwrap_err(),
            ConnectionError::Oversized { .. }
        ));
    }
}
