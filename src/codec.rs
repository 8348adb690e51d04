use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::frame::{Command, Frame};

/// Items produced by decoding one inbound transport payload.
///
/// A payload is either STOMP material (a decoded [`Frame`] or a lone-LF
/// `Heartbeat`) or, in SockJS mode, one of the SockJS control markers that
/// frame the session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF on the wire, `h` under SockJS)
    Heartbeat,
    /// SockJS open acknowledgement (`o`), sent once after the upgrade
    SockJsOpen,
    /// SockJS close notice (`c[code,"reason"]`); the connection is over
    SockJsClose { code: Option<u64>, reason: String },
}

/// Escape a STOMP header key or value for wire transmission.
///
/// Escapes backslash, carriage return, line feed and colon per the STOMP
/// escaping rules; [`unescape_header_value`] is its exact inverse.
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

/// Undo [`escape_header_value`].
///
/// Any escape sequence outside the four defined ones, or a dangling trailing
/// backslash, is a [`Error::MalformedFrame`].
pub fn unescape_header_value(input: &str) -> Result<String, Error> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => result.push('\\'),
            Some('r') => result.push('\r'),
            Some('n') => result.push('\n'),
            Some('c') => result.push(':'),
            Some(other) => {
                return Err(Error::MalformedFrame(format!(
                    "invalid header escape: \\{}",
                    other
                )));
            }
            None => {
                return Err(Error::MalformedFrame(
                    "dangling escape at end of header".into(),
                ));
            }
        }
    }
    Ok(result)
}

/// Encoder/decoder between [`Frame`] values and transport payloads.
///
/// The codec owns the framing mode for the lifetime of a connection: plain
/// STOMP-over-WebSocket, or SockJS where every payload is additionally
/// wrapped in the SockJS array-of-strings envelope. The mode is fixed at
/// construction; mixing modes mid-connection is not supported.
///
/// Encoding is purely syntactic: headers are written exactly as present on
/// the frame, so `decode(encode(f))` yields `f` back. Callers that want a
/// `content-length` header stamp it themselves.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    sockjs: bool,
}

impl FrameCodec {
    pub fn new(sockjs: bool) -> Self {
        Self { sockjs }
    }

    /// Serialize a frame into one outbound transport payload.
    pub fn encode(&self, frame: &Frame) -> Bytes {
        let raw = encode_frame(frame);
        if self.sockjs {
            wrap_sockjs(&raw)
        } else {
            raw
        }
    }

    /// The outbound heartbeat payload for this framing mode: a lone LF,
    /// wrapped as `["\n"]` under SockJS.
    pub fn encode_heartbeat(&self) -> Bytes {
        if self.sockjs {
            wrap_sockjs(b"\n")
        } else {
            Bytes::from_static(b"\n")
        }
    }

    /// Decode one inbound transport payload into its wire items.
    ///
    /// A plain payload may carry several frames back to back (brokers are
    /// allowed to pad with EOLs, which surface as heartbeat items); a SockJS
    /// `a[...]` payload fans out to one item per array element. An empty
    /// payload decodes to no items.
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<WireItem>, Error> {
        if self.sockjs {
            self.decode_sockjs(payload)
        } else {
            decode_stomp(payload)
        }
    }

    fn decode_sockjs(&self, payload: &[u8]) -> Result<Vec<WireItem>, Error> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::MalformedFrame(format!("sockjs payload not utf8: {}", e)))?;
        let text = text.trim_end_matches(['\r', '\n']);
        match text.as_bytes().first() {
            None => Ok(Vec::new()),
            Some(b'o') if text.len() == 1 => Ok(vec![WireItem::SockJsOpen]),
            Some(b'h') if text.len() == 1 => Ok(vec![WireItem::Heartbeat]),
            Some(b'a') => decode_sockjs_batch(&text[1..]),
            Some(b'[') => decode_sockjs_batch(text),
            Some(b'c') => decode_sockjs_close(&text[1..]),
            Some(_) => Err(Error::MalformedFrame(format!(
                "unrecognized sockjs payload: {:?}",
                truncate_for_log(text)
            ))),
        }
    }
}

fn encode_frame(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::with_capacity(64 + frame.body.len());
    dst.extend_from_slice(frame.command.as_str().as_bytes());
    dst.put_u8(b'\n');
    for (k, v) in &frame.headers {
        dst.extend_from_slice(escape_header_value(k).as_bytes());
        dst.put_u8(b':');
        dst.extend_from_slice(escape_header_value(v).as_bytes());
        dst.put_u8(b'\n');
    }
    dst.put_u8(b'\n');
    dst.extend_from_slice(&frame.body);
    dst.put_u8(0);
    dst.freeze()
}

/// Decode an unwrapped STOMP payload. Lone LFs (or CRLFs) between and around
/// frames are heartbeat items.
fn decode_stomp(payload: &[u8]) -> Result<Vec<WireItem>, Error> {
    let mut items = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        match payload[pos] {
            b'\n' => {
                items.push(WireItem::Heartbeat);
                pos += 1;
            }
            b'\r' if payload.get(pos + 1) == Some(&b'\n') => {
                items.push(WireItem::Heartbeat);
                pos += 2;
            }
            _ => {
                let (frame, consumed) = parse_frame(&payload[pos..])?;
                items.push(WireItem::Frame(frame));
                pos += consumed;
            }
        }
    }
    Ok(items)
}

/// Parse a single frame from the start of `input`, returning it together
/// with the number of bytes consumed (including the NUL terminator).
fn parse_frame(input: &[u8]) -> Result<(Frame, usize), Error> {
    // command line
    let cmd_end = input
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::MalformedFrame("missing command line terminator".into()))?;
    let mut cmd_bytes = &input[..cmd_end];
    if cmd_bytes.last() == Some(&b'\r') {
        cmd_bytes = &cmd_bytes[..cmd_bytes.len() - 1];
    }
    let command_str = std::str::from_utf8(cmd_bytes)
        .map_err(|e| Error::MalformedFrame(format!("invalid utf8 in command: {}", e)))?;
    let command = Command::try_from(command_str)?;
    let mut pos = cmd_end + 1;

    // header lines until the blank separator
    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line_end = input[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::MalformedFrame("missing header terminator (blank line)".into()))?;
        let mut line = &input[pos..pos + line_end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        pos += line_end + 1;
        if line.is_empty() {
            break;
        }
        let line = std::str::from_utf8(line)
            .map_err(|e| Error::MalformedFrame(format!("invalid utf8 in header: {}", e)))?;
        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::MalformedFrame(format!(
                "header line without colon: {:?}",
                line
            )));
        };
        headers.push((unescape_header_value(key)?, unescape_header_value(value)?));
    }

    // body: sized by content-length when present, else scan for the NUL
    let content_length = headers
        .iter()
        .rev()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| Error::MalformedFrame(format!("invalid content-length: {:?}", v)))
        })
        .transpose()?;
    let body_end = match content_length {
        Some(len) => {
            // bound against the remaining bytes, never pos + len, so an
            // absurd declared length cannot overflow the check
            let avail = input.len() - pos;
            if len >= avail {
                return Err(Error::MalformedFrame(
                    "body shorter than content-length".into(),
                ));
            }
            if input[pos + len] != 0 {
                return Err(Error::MalformedFrame(
                    "missing NUL terminator after content-length body".into(),
                ));
            }
            pos + len
        }
        None => {
            pos + input[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::MalformedFrame("missing NUL frame terminator".into()))?
        }
    };
    let body = input[pos..body_end].to_vec();
    Ok((
        Frame {
            command,
            headers,
            body,
        },
        body_end + 1,
    ))
}

/// Wrap an outbound payload in the SockJS client envelope: a one-element
/// JSON array of strings.
fn wrap_sockjs(raw: &[u8]) -> Bytes {
    // Outbound frames originate from this client and are built from string
    // payloads, so the lossy conversion never actually alters bytes.
    let text = String::from_utf8_lossy(raw);
    Bytes::from(serde_json::json!([text]).to_string())
}

fn decode_sockjs_batch(array: &str) -> Result<Vec<WireItem>, Error> {
    let elements: Vec<String> = serde_json::from_str(array)
        .map_err(|e| Error::MalformedFrame(format!("invalid sockjs array: {}", e)))?;
    let mut items = Vec::new();
    for element in &elements {
        items.extend(decode_stomp(element.as_bytes())?);
    }
    Ok(items)
}

fn decode_sockjs_close(body: &str) -> Result<Vec<WireItem>, Error> {
    let fields: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| Error::MalformedFrame(format!("invalid sockjs close: {}", e)))?;
    let code = fields.first().and_then(serde_json::Value::as_u64);
    let reason = fields
        .get(1)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(vec![WireItem::SockJsClose { code, reason }])
}

fn truncate_for_log(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(32)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}
