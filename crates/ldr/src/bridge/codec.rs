//! Framed codec for LDR connections.
//!
//! Decodes the fixed header, waits for the full body, then parses the
//! command-specific layout. Works over any AsyncRead/AsyncWrite via
//! `tokio_util::codec::Framed`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    CHALLENGE_LEN, Command, DoneOutcome, FileChunk, FileEntry, Frame, HEADER_LEN, Header,
    ID_STRING_LEN, IdString, MAX_BODY_LEN, Message, RESPONSE_LEN, RefuseReason, SpecialRequest,
    TaskDone, TaskRefusedReason, TaskRequest, TaskStateKind,
};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame body of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },
    #[error("unknown command {0:#06x}")]
    UnknownCommand(u16),
    #[error("command None is not valid on the wire")]
    NoneCommand,
    #[error("truncated {command:?} body")]
    Truncated { command: Command },
    #[error("{extra} trailing bytes after {command:?} body")]
    TrailingBytes { command: Command, extra: usize },
    #[error("invalid utf-8 string in {command:?} body")]
    InvalidUtf8 { command: Command },
    #[error("invalid {field} value {value} in {command:?} body")]
    InvalidValue {
        command: Command,
        field: &'static str,
        value: u16,
    },
    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),
    #[error("{0} entries do not fit a u16 count")]
    TooManyEntries(usize),
}

/// Codec for LDR frames.
#[derive(Debug, Clone)]
pub struct LdrCodec {
    max_body_len: usize,
}

impl Default for LdrCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LdrCodec {
    pub fn new() -> Self {
        Self {
            max_body_len: MAX_BODY_LEN,
        }
    }

    pub fn with_max_body_len(mut self, len: usize) -> Self {
        self.max_body_len = len;
        self
    }
}

impl Decoder for LdrCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_body_len {
            return Err(CodecError::FrameTooLarge {
                len: length,
                limit: self.max_body_len,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut head = src.split_to(HEADER_LEN);
        let header = Header {
            length: head.get_u32(),
            command: head.get_u16(),
            seq_no: head.get_u16(),
            ack_no: head.get_u16(),
        };
        let body = src.split_to(length).freeze();

        let command = match Command::from_u16(header.command) {
            Some(Command::None) => return Err(CodecError::NoneCommand),
            Some(command) => command,
            None => return Err(CodecError::UnknownCommand(header.command)),
        };

        tracing::trace!(?command, seq_no = header.seq_no, ack_no = header.ack_no, body_len = length, "Decoded frame");

        let message = decode_body(command, body)?;
        Ok(Some(Frame {
            seq_no: header.seq_no,
            ack_no: header.ack_no,
            message,
        }))
    }
}

impl Encoder<Frame> for LdrCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = frame.message.command();
        let mut body = BytesMut::new();
        encode_body(&frame.message, &mut body)?;

        if body.len() > self.max_body_len {
            return Err(CodecError::FrameTooLarge {
                len: body.len(),
                limit: self.max_body_len,
            });
        }

        tracing::trace!(?command, seq_no = frame.seq_no, ack_no = frame.ack_no, body_len = body.len(), "Encoding frame");

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_u16(command.as_u16());
        dst.put_u16(frame.seq_no);
        dst.put_u16(frame.ack_no);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::StringTooLong(s.len()))?;
    dst.put_u16(len);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

fn count_u16(n: usize) -> Result<u16, CodecError> {
    u16::try_from(n).map_err(|_| CodecError::TooManyEntries(n))
}

fn encode_body(message: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
    match message {
        Message::ChallengeRequest {
            id,
            protocol_vers,
            challenge,
        } => {
            dst.extend_from_slice(id.as_bytes());
            dst.put_u16(*protocol_vers);
            dst.extend_from_slice(challenge);
        }
        Message::ChallengeResponse { id, response } => {
            dst.extend_from_slice(id.as_bytes());
            dst.extend_from_slice(response);
        }
        Message::NowConnected { njobs, start_time } => {
            dst.put_u16(*njobs);
            dst.put_u64(*start_time);
        }
        Message::ConnectionRefused { reason } => {
            dst.put_u16(reason.as_u16());
        }
        Message::TaskRequest(req) => {
            let oformat_len =
                u16::try_from(req.oformat.len()).map_err(|_| CodecError::StringTooLong(req.oformat.len()))?;
            dst.put_u32(req.frame_no);
            dst.put_u16(req.width);
            dst.put_u16(req.height);
            dst.put_u16(oformat_len);
            dst.put_u16(count_u16(req.files.len())?);
            dst.put_u16(count_u16(req.args.len())?);
            dst.extend_from_slice(req.oformat.as_bytes());
            for file in &req.files {
                dst.put_u64(file.mtime);
                dst.put_u64(file.size);
                put_string(dst, &file.name)?;
            }
            for arg in &req.args {
                put_string(dst, arg)?;
            }
        }
        Message::TaskRefused { frame_no, reason } => {
            dst.put_u32(*frame_no);
            dst.put_u16(reason.as_u16());
        }
        Message::FileRequest { frame_no, files } => {
            dst.put_u32(*frame_no);
            dst.put_u16(count_u16(files.len())?);
            for name in files {
                put_string(dst, name)?;
            }
        }
        Message::TaskState { frame_no, state } => {
            dst.put_u32(*frame_no);
            dst.put_u16(state.as_u16());
        }
        Message::TaskDone(done) => {
            dst.put_u32(done.frame_no);
            dst.put_u16(done.outcome.as_u16());
            dst.put_i32(done.code);
            dst.put_u64(done.render_ms);
        }
        Message::FileTransmission(chunk) => {
            dst.put_u32(chunk.frame_no);
            put_string(dst, &chunk.name)?;
            dst.put_u64(chunk.total_size);
            dst.put_u64(chunk.offset);
            dst.extend_from_slice(&chunk.data);
        }
        Message::SpecialTaskRequest { frame_no, request } => {
            dst.put_u32(*frame_no);
            dst.put_u16(request.as_u16());
        }
        Message::EndOfStream => {}
    }
    Ok(())
}

/// Bounds-checked cursor over a frame body.
struct BodyReader {
    command: Command,
    buf: Bytes,
}

impl BodyReader {
    fn new(command: Command, buf: Bytes) -> Self {
        Self { command, buf }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                command: self.command,
            });
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes, CodecError> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn utf8(&mut self, len: usize) -> Result<String, CodecError> {
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 {
            command: self.command,
        })
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        self.utf8(len)
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    fn wire<T>(
        &mut self,
        field: &'static str,
        convert: impl Fn(u16) -> Option<T>,
    ) -> Result<T, CodecError> {
        let value = self.u16()?;
        convert(value).ok_or(CodecError::InvalidValue {
            command: self.command,
            field,
            value,
        })
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.buf.has_remaining() {
            return Err(CodecError::TrailingBytes {
                command: self.command,
                extra: self.buf.remaining(),
            });
        }
        Ok(())
    }
}

fn decode_body(command: Command, body: Bytes) -> Result<Message, CodecError> {
    let mut r = BodyReader::new(command, body);
    let message = match command {
        Command::None => return Err(CodecError::NoneCommand),
        Command::ChallengeRequest => Message::ChallengeRequest {
            id: IdString::from_bytes(r.array::<ID_STRING_LEN>()?),
            protocol_vers: r.u16()?,
            challenge: r.array::<CHALLENGE_LEN>()?,
        },
        Command::ChallengeResponse => Message::ChallengeResponse {
            id: IdString::from_bytes(r.array::<ID_STRING_LEN>()?),
            response: r.array::<RESPONSE_LEN>()?,
        },
        Command::NowConnected => Message::NowConnected {
            njobs: r.u16()?,
            start_time: r.u64()?,
        },
        Command::ConnectionRefused => Message::ConnectionRefused {
            reason: r.wire("reason", RefuseReason::from_u16)?,
        },
        Command::TaskRequest => {
            let frame_no = r.u32()?;
            let width = r.u16()?;
            let height = r.u16()?;
            let oformat_len = r.u16()? as usize;
            let n_files = r.u16()? as usize;
            let n_add_args = r.u16()? as usize;
            let oformat = r.utf8(oformat_len)?;
            let mut files = Vec::with_capacity(n_files);
            for _ in 0..n_files {
                files.push(FileEntry {
                    mtime: r.u64()?,
                    size: r.u64()?,
                    name: r.string()?,
                });
            }
            let mut args = Vec::with_capacity(n_add_args);
            for _ in 0..n_add_args {
                args.push(r.string()?);
            }
            Message::TaskRequest(TaskRequest {
                frame_no,
                width,
                height,
                oformat,
                files,
                args,
            })
        }
        Command::TaskRefused => Message::TaskRefused {
            frame_no: r.u32()?,
            reason: r.wire("reason", TaskRefusedReason::from_u16)?,
        },
        Command::FileRequest => {
            let frame_no = r.u32()?;
            let n_files = r.u16()? as usize;
            let mut files = Vec::with_capacity(n_files);
            for _ in 0..n_files {
                files.push(r.string()?);
            }
            Message::FileRequest { frame_no, files }
        }
        Command::TaskState => Message::TaskState {
            frame_no: r.u32()?,
            state: r.wire("state", TaskStateKind::from_u16)?,
        },
        Command::TaskDone => Message::TaskDone(TaskDone {
            frame_no: r.u32()?,
            outcome: r.wire("outcome", DoneOutcome::from_u16)?,
            code: r.i32()?,
            render_ms: r.u64()?,
        }),
        Command::FileTransmission => {
            let frame_no = r.u32()?;
            let name = r.string()?;
            let total_size = r.u64()?;
            let offset = r.u64()?;
            let data = r.rest();
            Message::FileTransmission(FileChunk {
                frame_no,
                name,
                total_size,
                offset,
                data,
            })
        }
        Command::SpecialTaskRequest => Message::SpecialTaskRequest {
            frame_no: r.u32()?,
            request: r.wire("request", SpecialRequest::from_u16)?,
        },
        Command::EndOfStream => Message::EndOfStream,
    };
    r.finish()?;
    Ok(message)
}
