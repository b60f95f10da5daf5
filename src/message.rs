//! Message framing protocol
//!
//! Every frame on the wire is `TAG + PAYLOAD + TERMINATOR`:
//! a fixed 6-byte tag, a payload (only `Normal` and `Info` frames carry one),
//! and the fixed 5-byte terminator `[EOM]`. There is no length prefix and no
//! escaping, so payloads may never contain the terminator.

use std::fmt;

use crate::error::{FrameError, RelayError};

/// Width of the tag region at the start of every frame
pub const TAG_WIDTH: usize = 6;

/// End-of-message marker
pub const TERMINATOR: &[u8] = b"[EOM]";

/// Frame type, decided by the tag region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Chat text, relayed to every other peer
    Normal,
    /// Peer is leaving
    Exit,
    /// Server-wide stop request
    Shutdown,
    /// A peer is present
    Join,
    /// A peer dropped without saying goodbye
    Leave,
    /// Diagnostic text from the server
    Info,
    /// Tag not recognized, or frame shorter than a tag
    Unknown,
}

impl FrameKind {
    /// All kinds that have a wire tag
    pub const TAGGED: [FrameKind; 6] = [
        FrameKind::Normal,
        FrameKind::Exit,
        FrameKind::Shutdown,
        FrameKind::Join,
        FrameKind::Leave,
        FrameKind::Info,
    ];

    /// Wire tag for this kind (`None` for `Unknown`)
    pub fn tag(self) -> Option<&'static [u8; TAG_WIDTH]> {
        match self {
            FrameKind::Normal => Some(b"[NORM]"),
            FrameKind::Exit => Some(b"[EXIT]"),
            FrameKind::Shutdown => Some(b"[SHUT]"),
            FrameKind::Join => Some(b"[LNK1]"),
            FrameKind::Leave => Some(b"[LNK0]"),
            FrameKind::Info => Some(b"[INFO]"),
            FrameKind::Unknown => None,
        }
    }

    /// Whether frames of this kind carry a payload
    pub fn carries_payload(self) -> bool {
        matches!(self, FrameKind::Normal | FrameKind::Info)
    }
}

/// Classify a raw frame by its tag region
pub fn classify(raw: &[u8]) -> FrameKind {
    let Some(tag) = raw.get(..TAG_WIDTH) else {
        return FrameKind::Unknown;
    };
    FrameKind::TAGGED
        .into_iter()
        .find(|kind| kind.tag().is_some_and(|t| t.as_slice() == tag))
        .unwrap_or(FrameKind::Unknown)
}

/// Bytes strictly between the tag and the terminator
///
/// A missing terminator is tolerated: everything after the tag is returned.
pub fn payload(raw: &[u8]) -> &[u8] {
    if raw.len() < TAG_WIDTH {
        return &[];
    }
    let body = &raw[TAG_WIDTH..];
    body.strip_suffix(TERMINATOR).unwrap_or(body)
}

/// Concatenate tag, payload and terminator
///
/// Performs no validation; use [`Frame::new`] to build checked frames.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let tag = kind.tag().map(|t| t.as_slice()).unwrap_or_default();
    let mut out = Vec::with_capacity(tag.len() + payload.len() + TERMINATOR.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(payload);
    out.extend_from_slice(TERMINATOR);
    out
}

/// Find the first terminator in `buf`, starting the scan at `from`
pub fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
        .map(|pos| pos + from)
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, checking the payload against the kind
    pub fn new(kind: FrameKind, payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if kind == FrameKind::Unknown {
            return Err(FrameError::UnknownTag);
        }
        if !kind.carries_payload() && !payload.is_empty() {
            return Err(FrameError::PayloadNotAllowed(kind));
        }
        if find_terminator(&payload, 0).is_some() {
            return Err(FrameError::TerminatorInPayload);
        }
        Ok(Self { kind, payload })
    }

    /// Control frame with an empty payload
    pub fn control(kind: FrameKind) -> Result<Self, FrameError> {
        Self::new(kind, Vec::new())
    }

    /// Chat frame
    pub fn normal(text: &str) -> Result<Self, FrameError> {
        Self::new(FrameKind::Normal, text.as_bytes())
    }

    /// Server diagnostic frame
    pub fn info(text: &str) -> Result<Self, FrameError> {
        Self::new(FrameKind::Info, text.as_bytes())
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self.kind, &self.payload)
    }

    /// Decode one complete raw frame
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let kind = classify(raw);
        if kind == FrameKind::Unknown {
            return Err(FrameError::UnknownTag);
        }
        if !raw[TAG_WIDTH..].ends_with(TERMINATOR) {
            return Err(FrameError::MissingTerminator);
        }
        Self::new(kind, payload(raw))
    }
}

/// Turn an error into a diagnostic `INFO` frame for the affected client
impl From<&RelayError> for Frame {
    fn from(err: &RelayError) -> Self {
        // brackets are the only way the text could spell the terminator
        let text = err.to_string().replace('[', "(");
        Frame {
            kind: FrameKind::Info,
            payload: text.into_bytes(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, String::from_utf8_lossy(&self.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_kind() {
        for kind in FrameKind::TAGGED {
            let body: &[u8] = if kind.carries_payload() { b"hello [EO] world" } else { b"" };
            let frame = Frame::new(kind, body).unwrap();
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(classify(&frame.encode()), kind);
        }
    }

    #[test]
    fn test_wire_layout() {
        assert_eq!(Frame::normal("hello").unwrap().encode(), b"[NORM]hello[EOM]");
        assert_eq!(Frame::control(FrameKind::Exit).unwrap().encode(), b"[EXIT][EOM]");
        assert_eq!(Frame::info("x").unwrap().encode(), b"[INFO]x[EOM]");
    }

    #[test]
    fn test_classify_short_or_unknown() {
        assert_eq!(classify(b"[NOR"), FrameKind::Unknown);
        assert_eq!(classify(b""), FrameKind::Unknown);
        assert_eq!(classify(b"[XXXX]hi[EOM]"), FrameKind::Unknown);
        assert_eq!(classify(b"[SHUT]"), FrameKind::Shutdown);
    }

    #[test]
    fn test_payload_extraction() {
        assert_eq!(payload(b"[NORM]abc[EOM]"), b"abc");
        assert_eq!(payload(b"[EXIT][EOM]"), b"");
        assert_eq!(payload(b"[NORM]no-end"), b"no-end");
        assert_eq!(payload(b"[NO"), b"");
    }

    #[test]
    fn test_rejects_invalid_frames() {
        assert_eq!(
            Frame::new(FrameKind::Exit, b"x".as_slice()),
            Err(FrameError::PayloadNotAllowed(FrameKind::Exit))
        );
        assert_eq!(Frame::normal("a[EOM]b"), Err(FrameError::TerminatorInPayload));
        assert_eq!(Frame::control(FrameKind::Unknown), Err(FrameError::UnknownTag));
        assert_eq!(Frame::decode(b"[NORM]abc"), Err(FrameError::MissingTerminator));
        assert_eq!(Frame::decode(b"[BAD!]abc[EOM]"), Err(FrameError::UnknownTag));
    }

    #[test]
    fn test_error_becomes_info_frame() {
        let frame = Frame::from(&RelayError::Capacity { capacity: 2 });
        assert_eq!(frame.kind(), FrameKind::Info);
        assert_eq!(frame.text(), "maximum number of clients (2) reached");
        assert!(Frame::decode(&frame.encode()).is_ok());
    }

    #[test]
    fn test_find_terminator_offsets() {
        assert_eq!(find_terminator(b"ab[EOM]cd", 0), Some(2));
        assert_eq!(find_terminator(b"ab[EOM]cd", 3), None);
        assert_eq!(find_terminator(b"[EOM][EOM]", 1), Some(5));
        assert_eq!(find_terminator(b"ab", 10), None);
    }
}
