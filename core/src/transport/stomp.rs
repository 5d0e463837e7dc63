/// STOMP 1.2 framing for the push transport
use crate::error::{ChatError, Result};
use std::fmt;
use std::time::Duration;

/// Versions offered in CONNECT
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

const NUL: char = '\0';

/// Frame commands used by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "CONNECT" | "STOMP" => Ok(Command::Connect),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "SEND" => Ok(Command::Send),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            "DISCONNECT" => Ok(Command::Disconnect),
            other => Err(ChatError::Protocol(format!("Unknown STOMP command: {}", other))),
        }
    }

    /// CONNECT and CONNECTED headers are not escaped (STOMP 1.2 §Value Encoding)
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT with bearer credentials and our heart-beat offer
    pub fn connect(host: &str, token: &str, heartbeat_out: Duration, heartbeat_in: Duration) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header(
                "heart-beat",
                format!("{},{}", heartbeat_out.as_millis(), heartbeat_in.as_millis()),
            )
            .header("Authorization", format!("Bearer {}", token))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// SEND with a JSON body
    pub fn send_json(destination: &str, json: String) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(json)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Serialize to wire text, NUL terminated
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

/// Heart-beat intervals agreed with the broker; `None` means disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

impl Heartbeat {
    /// Combine our offer with the `heart-beat` header of CONNECTED.
    /// Each direction runs at the slower of the two rates, or not at all if
    /// either side declined.
    pub fn negotiate(client_out: Duration, client_in: Duration, server_header: Option<&str>) -> Self {
        let (server_out, server_in) = server_header
            .and_then(|h| {
                let (sx, sy) = h.split_once(',')?;
                Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?))
            })
            .unwrap_or((0, 0));

        let pick = |ours: Duration, theirs_ms: u64| {
            if ours.is_zero() || theirs_ms == 0 {
                None
            } else {
                Some(ours.max(Duration::from_millis(theirs_ms)))
            }
        };

        Self {
            outgoing: pick(client_out, server_in),
            incoming: pick(client_in, server_out),
        }
    }
}

/// Incremental decoder; keeps partial frames until the rest arrives
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport message. Returns complete frames in arrival order.
    /// Heart-beat EOLs are consumed silently.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<Frame>> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        loop {
            let trimmed = self.buffer.trim_start_matches(|c: char| c == '\n' || c == '\r');
            let skipped = self.buffer.len() - trimmed.len();
            if skipped > 0 {
                self.buffer.drain(..skipped);
            }
            if self.buffer.is_empty() {
                break;
            }
            match parse_frame(&self.buffer) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.drain(..consumed);
                    frames.push(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    // No way to find the next frame boundary in a corrupt buffer
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }

        Ok(frames)
    }

    /// Bytes waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Parse one frame from the front of `input`. `Ok(None)` means incomplete.
fn parse_frame(input: &str) -> Result<Option<(Frame, usize)>> {
    let Some(header_end) = find_header_end(input) else {
        return Ok(None);
    };
    let (head, body_start) = header_end;

    let mut lines = head.lines();
    let command_line = lines.next().unwrap_or_default().trim_end_matches('\r');
    let command = Command::parse(command_line)?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ChatError::Protocol(format!("Malformed header line: {}", line)))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| ChatError::Protocol(format!("Bad content-length: {}", v)))
        })
        .transpose()?;

    let rest = &input[body_start..];
    let (body, consumed_body) = match content_length {
        Some(len) => {
            // Need the body plus the trailing NUL
            if rest.len() < len + 1 {
                return Ok(None);
            }
            if !rest.is_char_boundary(len) || rest.as_bytes()[len] != 0 {
                return Err(ChatError::Protocol(
                    "Frame body not terminated by NUL after content-length".to_string(),
                ));
            }
            (rest[..len].to_string(), len + 1)
        }
        None => match rest.find(NUL) {
            Some(pos) => (rest[..pos].to_string(), pos + 1),
            None => return Ok(None),
        },
    };

    let frame = Frame {
        command,
        headers,
        body,
    };
    Ok(Some((frame, body_start + consumed_body)))
}

/// Locate the blank line ending the header block. Returns the head text and
/// the offset where the body begins.
fn find_header_end(input: &str) -> Option<(&str, usize)> {
    if let Some(pos) = input.find("\n\n") {
        let crlf = input.find("\r\n\r\n");
        if let Some(c) = crlf {
            if c < pos {
                return Some((&input[..c], c + 4));
            }
        }
        return Some((&input[..pos], pos + 2));
    }
    input.find("\r\n\r\n").map(|c| (&input[..c], c + 4))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(ChatError::Protocol(format!(
                    "Invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_connect_is_not_escaped() {
        let frame = Frame::connect("localhost", "tok:en", Duration::from_secs(10), Duration::from_secs(10));
        let wire = frame.encode();
        assert!(wire.starts_with("CONNECT\n"));
        assert!(wire.contains("Authorization:Bearer tok:en\n"));
        assert!(wire.contains("heart-beat:10000,10000\n"));
        assert!(wire.ends_with("\n\n\0"));
    }

    #[test]
    fn test_send_frame_wire_format() {
        let frame = Frame::send_json("/app/chat.private", "{\"a\":1}".to_string());
        let wire = frame.encode();
        assert_eq!(
            wire,
            "SEND\ndestination:/app/chat.private\ncontent-type:application/json\ncontent-length:7\n\n{\"a\":1}\0"
        );
    }

    #[test]
    fn test_decode_message_with_escaped_header() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .push("MESSAGE\ndestination:/user/queue/messages\nnote:a\\cb\\\\c\nsubscription:sub-0\n\n{\"x\":1}\0")
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Message);
        assert_eq!(frames[0].get("note"), Some("a:b\\c"));
        assert_eq!(frames[0].body, "{\"x\":1}");
    }

    #[test]
    fn test_decoder_buffers_partial_frames_and_heartbeats() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push("\n").unwrap().is_empty());
        assert!(decoder.push("MESSAGE\nsubscription:sub-0\n\nhel").unwrap().is_empty());
        assert!(decoder.pending() > 0);
        let frames = decoder.push("lo\0\nRECEIPT\nreceipt-id:7\n\n\0").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body, "hello");
        assert_eq!(frames[1].command, Command::Receipt);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push("MESSAGE\ncontent-length:3\n\na\0b\0").unwrap();
        assert_eq!(frames[0].body, "a\0b");
    }

    #[test]
    fn test_crlf_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .push("CONNECTED\r\nversion:1.2\r\nheart-beat:0,0\r\n\r\n\0")
            .unwrap();
        assert_eq!(frames[0].command, Command::Connected);
        assert_eq!(frames[0].get("version"), Some("1.2"));
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.push("BOGUS\n\n\0"), Err(ChatError::Protocol(_))));
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let ten = Duration::from_secs(10);
        let hb = Heartbeat::negotiate(ten, ten, Some("20000,0"));
        assert_eq!(hb.outgoing, None);
        assert_eq!(hb.incoming, Some(Duration::from_secs(20)));

        let hb = Heartbeat::negotiate(ten, Duration::ZERO, Some("5000,5000"));
        assert_eq!(hb.outgoing, Some(ten));
        assert_eq!(hb.incoming, None);

        let hb = Heartbeat::negotiate(ten, ten, None);
        assert_eq!(hb, Heartbeat { outgoing: None, incoming: None });
    }
}
