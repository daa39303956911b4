//! Length-prefixed framing for natter connections.
//!
//! Wire format: `[4-byte big-endian length][1-byte type][body]`, where the
//! length counts the type byte plus the body. Control bodies are CBOR;
//! `DataFrame` bodies are `[flag][16-byte session id if flag = 1][payload]`.

use crate::error::{NatterError, NatterResult};
use crate::messages::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on `type + body` length.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

/// Encode a message into a complete frame.
pub fn frame_encode(msg: &Message) -> NatterResult<Vec<u8>> {
    let mut frame = Vec::with_capacity(HEADER_LEN + 64);
    frame.extend_from_slice(&[0u8; HEADER_LEN]);
    frame.push(msg.msg_type().into());

    match msg {
        Message::Register(p) => ciborium::into_writer(p, &mut frame)?,
        Message::RegisterAck(p) => ciborium::into_writer(p, &mut frame)?,
        Message::ForwardRequest(p) => ciborium::into_writer(p, &mut frame)?,
        Message::ForwardAck(p) => ciborium::into_writer(p, &mut frame)?,
        Message::ForwardNotify(p) => ciborium::into_writer(p, &mut frame)?,
        Message::Join(p) => ciborium::into_writer(p, &mut frame)?,
        Message::Close(p) => ciborium::into_writer(p, &mut frame)?,
        Message::Data(d) => {
            match d.session_id {
                Some(id) => {
                    frame.push(1);
                    frame.extend_from_slice(id.as_bytes());
                }
                None => frame.push(0),
            }
            frame.extend_from_slice(&d.payload);
        }
        Message::Heartbeat => {}
    }

    let len = (frame.len() - HEADER_LEN) as u32;
    frame[..HEADER_LEN].copy_from_slice(&len.to_be_bytes());
    Ok(frame)
}

/// Decode the contents of one frame (type byte plus body, no length prefix).
pub fn frame_decode(frame: &[u8]) -> NatterResult<Message> {
    let (&tag, body) = frame
        .split_first()
        .ok_or_else(|| NatterError::MalformedFrame("empty frame".into()))?;
    let msg_type = MsgType::try_from(tag).map_err(NatterError::MalformedFrame)?;

    let msg = match msg_type {
        MsgType::Register => Message::Register(cbor_decode(body)?),
        MsgType::RegisterAck => Message::RegisterAck(cbor_decode(body)?),
        MsgType::ForwardRequest => Message::ForwardRequest(cbor_decode(body)?),
        MsgType::ForwardAck => Message::ForwardAck(cbor_decode(body)?),
        MsgType::ForwardNotify => Message::ForwardNotify(cbor_decode(body)?),
        MsgType::Join => Message::Join(cbor_decode(body)?),
        MsgType::Close => Message::Close(cbor_decode(body)?),
        MsgType::DataFrame => Message::Data(decode_data(body)?),
        // Any heartbeat body is ignored.
        MsgType::Heartbeat => Message::Heartbeat,
    };
    Ok(msg)
}

fn cbor_decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> NatterResult<T> {
    let value: T = ciborium::from_reader(body)?;
    Ok(value)
}

fn decode_data(body: &[u8]) -> NatterResult<DataFrame> {
    match body.split_first() {
        Some((0, payload)) => Ok(DataFrame {
            session_id: None,
            payload: payload.to_vec(),
        }),
        Some((1, rest)) if rest.len() >= SESSION_ID_LEN => {
            let (id, payload) = rest.split_at(SESSION_ID_LEN);
            Ok(DataFrame {
                session_id: SessionId::from_slice(id),
                payload: payload.to_vec(),
            })
        }
        Some((1, _)) => Err(NatterError::MalformedFrame(
            "data frame session id truncated".into(),
        )),
        Some((flag, _)) => Err(NatterError::MalformedFrame(format!(
            "invalid data frame flag: {flag}"
        ))),
        None => Err(NatterError::MalformedFrame("data frame missing flag".into())),
    }
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Append raw bytes without decoding.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete message, if one is buffered.
    ///
    /// Fails with `MalformedFrame` as soon as a header announces a length of
    /// zero or above the configured maximum.
    pub fn next_message(&mut self) -> NatterResult<Option<Message>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;

        if len == 0 {
            return Err(NatterError::MalformedFrame("zero-length frame".into()));
        }
        if len > self.max_frame_len {
            return Err(NatterError::MalformedFrame(format!(
                "frame too large: {len} bytes (max {})",
                self.max_frame_len
            )));
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let msg = frame_decode(&self.buffer[HEADER_LEN..HEADER_LEN + len]);
        self.buffer.drain(..HEADER_LEN + len);
        msg.map(Some)
    }

    /// Feed bytes into the decoder and return all complete messages.
    pub fn feed(&mut self, data: &[u8]) -> NatterResult<Vec<Message>> {
        self.push(data);
        let mut messages = Vec::new();
        while let Some(msg) = self.next_message()? {
            messages.push(msg);
        }
        Ok(messages)
    }

    /// Take whatever bytes are buffered but not yet decoded.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Buffered frame reader over an async byte stream.
///
/// [`FrameReader::next_message`] is cancel-safe: a partially received frame
/// stays buffered if the future is dropped inside `tokio::select!`.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_len: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_frame_len),
            buf: vec![0u8; 16 * 1024],
        }
    }

    /// Read the next message. Returns `Ok(None)` on a clean EOF at a frame
    /// boundary; EOF inside a frame is `MalformedFrame`.
    pub async fn next_message(&mut self) -> NatterResult<Option<Message>> {
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(Some(msg));
            }
            let n = self
                .reader
                .read(&mut self.buf)
                .await
                .map_err(|e| NatterError::Transport(format!("read failed: {e}")))?;
            if n == 0 {
                return match self.decoder.pending() {
                    0 => Ok(None),
                    pending => Err(NatterError::MalformedFrame(format!(
                        "connection closed inside a frame ({pending} bytes buffered)"
                    ))),
                };
            }
            self.decoder.push(&self.buf[..n]);
        }
    }

    /// Give back the underlying reader and any bytes read past the last
    /// decoded frame.
    pub fn into_parts(mut self) -> (R, Vec<u8>) {
        let pending = self.decoder.take_pending();
        (self.reader, pending)
    }
}

/// Read exactly one frame from `reader`, consuming no bytes past its end.
///
/// Used for handshake frames before a connection is handed to a raw byte
/// pump. Returns `Ok(None)` on a clean EOF before the first header byte.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_len: usize,
) -> NatterResult<Option<Message>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(|e| NatterError::Transport(format!("read failed: {e}")))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NatterError::MalformedFrame("truncated frame header".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(NatterError::MalformedFrame("zero-length frame".into()));
    }
    if len > max_frame_len {
        return Err(NatterError::MalformedFrame(format!(
            "frame too large: {len} bytes (max {max_frame_len})"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => NatterError::MalformedFrame("truncated frame".into()),
        _ => NatterError::Transport(format!("read failed: {e}")),
    })?;
    frame_decode(&body).map(Some)
}

/// Encode and write one message, flushing the writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> NatterResult<()> {
    let frame = frame_encode(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| NatterError::Transport(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| NatterError::Transport(format!("flush failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_request() -> Message {
        Message::ForwardRequest(ForwardRequestPayload {
            version: PROTOCOL_VERSION,
            source: "alice".into(),
            peer_name: "bob".into(),
            target_addr: ":22".into(),
            target_command: Vec::new(),
        })
    }

    #[test]
    fn frame_layout() {
        let frame = frame_encode(&Message::Heartbeat).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 1, 0x09]);

        let frame = frame_encode(&data(b"hi")).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 4, 0x07, 0, b'h', b'i']);
    }

    #[test]
    fn control_and_data_share_a_stream() {
        let sid = SessionId::random();
        let msgs = vec![
            forward_request(),
            forward_ok(sid),
            Message::Data(DataFrame {
                session_id: Some(sid),
                payload: vec![0, 255, 10, 13, 0],
            }),
            data(b""),
            Message::Heartbeat,
            close(sid, CloseReason::DialFailed, Some("connection refused")),
        ];

        let mut combined = Vec::new();
        for m in &msgs {
            combined.extend(frame_encode(m).unwrap());
        }

        let mut decoder = FrameDecoder::default();
        let decoded = decoder.feed(&combined).unwrap();
        assert_eq!(decoded, msgs);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn incremental_feed() {
        let frame = frame_encode(&register("bob")).unwrap();
        let mut decoder = FrameDecoder::default();

        // Feed one byte at a time
        for i in 0..frame.len() - 1 {
            assert!(decoder.feed(&frame[i..i + 1]).unwrap().is_empty());
        }
        let decoded = decoder.feed(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(decoded, vec![register("bob")]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = frame_encode(&data(&[7u8; 200])).unwrap();
        let mut decoder = FrameDecoder::new(100);
        // Rejected from the header alone, before the body arrives.
        let err = decoder.feed(&frame[..HEADER_LEN]).unwrap_err();
        assert!(matches!(err, NatterError::MalformedFrame(_)));
    }

    #[test]
    fn zero_length_and_unknown_tag_are_rejected() {
        let mut decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.feed(&[0, 0, 0, 0]),
            Err(NatterError::MalformedFrame(_))
        ));

        let mut decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.feed(&[0, 0, 0, 1, 0x7f]),
            Err(NatterError::MalformedFrame(_))
        ));
    }

    #[test]
    fn garbage_body_is_malformed() {
        // Register tag with a body that is not a CBOR map.
        let err = frame_decode(&[0x01, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, NatterError::MalformedFrame(_)));

        // Data frame claiming a session id but carrying only 3 bytes of it.
        let err = frame_decode(&[0x07, 1, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, NatterError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        #[derive(serde::Serialize)]
        struct FutureRegister {
            version: u8,
            name: String,
            capabilities: Vec<String>,
        }

        let mut frame = vec![0x01];
        ciborium::into_writer(
            &FutureRegister {
                version: 2,
                name: "bob".into(),
                capabilities: vec!["udp".into()],
            },
            &mut frame,
        )
        .unwrap();

        match frame_decode(&frame).unwrap() {
            Message::Register(p) => {
                assert_eq!(p.name, "bob");
                assert_eq!(p.version, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_version_defaults() {
        #[derive(serde::Serialize)]
        struct OldRegister {
            name: String,
        }
        let mut frame = vec![0x01];
        ciborium::into_writer(&OldRegister { name: "bob".into() }, &mut frame).unwrap();
        assert_eq!(frame_decode(&frame).unwrap(), register("bob"));
    }

    #[tokio::test]
    async fn reader_distinguishes_clean_eof_from_truncation() {
        let frame = frame_encode(&register("bob")).unwrap();

        let mut reader = FrameReader::new(&frame[..], DEFAULT_MAX_FRAME_LEN);
        assert_eq!(reader.next_message().await.unwrap(), Some(register("bob")));
        assert_eq!(reader.next_message().await.unwrap(), None);

        let truncated = &frame[..frame.len() - 1];
        let mut reader = FrameReader::new(truncated, DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(
            reader.next_message().await,
            Err(NatterError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn reader_returns_leftover_bytes() {
        let mut bytes = frame_encode(&join(SessionId::random())).unwrap();
        let follow_up = frame_encode(&data(b"early")).unwrap();
        bytes.extend_from_slice(&follow_up);

        let mut reader = FrameReader::new(&bytes[..], DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(reader.next_message().await.unwrap(), Some(Message::Join(_))));
        let (_, leftover) = reader.into_parts();
        assert_eq!(leftover, follow_up);
    }

    #[tokio::test]
    async fn read_frame_stops_at_frame_boundary() {
        let mut bytes = frame_encode(&register("bob")).unwrap();
        bytes.extend_from_slice(b"raw tail");

        let mut cursor = &bytes[..];
        let msg = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(msg, Some(register("bob")));
        assert_eq!(cursor, b"raw tail");

        let mut empty: &[u8] = &[];
        assert_eq!(read_frame(&mut empty, DEFAULT_MAX_FRAME_LEN).await.unwrap(), None);

        let mut short: &[u8] = &[0, 0, 0, 9, 0x01];
        assert!(matches!(
            read_frame(&mut short, DEFAULT_MAX_FRAME_LEN).await,
            Err(NatterError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn write_frame_then_read_back() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut w) = tokio::io::split(client);
        let (r, _) = tokio::io::split(server);

        write_frame(&mut w, &forward_request()).await.unwrap();
        write_frame(&mut w, &Message::Heartbeat).await.unwrap();
        drop(w);

        let mut reader = FrameReader::new(r, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(reader.next_message().await.unwrap(), Some(forward_request()));
        assert_eq!(reader.next_message().await.unwrap(), Some(Message::Heartbeat));
    }
}
