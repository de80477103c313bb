//! Wire Protocol
//!
//! Every message travels in a single datagram as UTF-8 text: a verb followed by
//! `|`-delimited fields. Chunk payloads are base64 encoded so arbitrary bytes can
//! ride inside the text form without ever producing the delimiter.
//!
//! ```text
//! GET|<filename>
//! PUT|<filename>|<size>
//! OK                      upload accepted
//! OK|<size>|<basename>    download offered
//! ERR|<reason>[|<detail>]
//! DAT|<seq>|<base64 payload>
//! ACK|<seq> | ACK|START | ACK|EOF
//! EOF|<next seq>
//! ```
//!
//! Incoming bytes are decoded into [`Message`] at the socket boundary; nothing
//! past the boundary looks at raw text.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Field delimiter. Base64 never emits it.
pub const DELIMITER: char = '|';

/// Largest datagram we ever read or write.
pub const MAX_DATAGRAM: usize = 65_507;

/// Message verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Client asks the server for a file.
    Get,
    /// Client announces an upload and its byte length.
    Put,
    /// Request accepted. Carries the size and basename when answering a `GET`.
    Ok,
    /// Request refused or session error.
    Err,
    /// One chunk of file data.
    Data,
    /// Acknowledgment of a chunk, of readiness (`START`) or of end-of-stream.
    Ack,
    /// End of stream, carrying the sequence number after the last chunk.
    Eof,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Ok => "OK",
            Self::Err => "ERR",
            Self::Data => "DAT",
            Self::Ack => "ACK",
            Self::Eof => "EOF",
        }
    }

    /// Verbs are case sensitive on the wire.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "PUT" => Some(Self::Put),
            "OK" => Some(Self::Ok),
            "ERR" => Some(Self::Err),
            "DAT" => Some(Self::Data),
            "ACK" => Some(Self::Ack),
            "EOF" => Some(Self::Eof),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason token carried by an `ERR` message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// The request header could not be parsed.
    BadHeader,
    /// The requested file does not exist (or is outside the serving root).
    NotFound,
    /// An upload is already in progress.
    Busy,
    /// The datagram does not belong to an active session.
    NoSession,
    /// The verb is not served on this endpoint.
    UnknownCommand,
    /// Anything else, typically an I/O error kind such as `PermissionDenied`.
    ///
    /// The token must not contain `|`: anything after one decodes as the
    /// detail field. Build it with [`ErrorReason::other`].
    Other(String),
}

impl ErrorReason {
    /// An `Other` reason, with any `|` replaced so it stays a single field
    pub fn other(token: impl Into<String>) -> Self {
        Self::Other(token.into().replace(DELIMITER, "_"))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::BadHeader => "BadHeader",
            Self::NotFound => "NotFound",
            Self::Busy => "Busy",
            Self::NoSession => "NoSession",
            Self::UnknownCommand => "UnknownCommand",
            Self::Other(reason) => reason,
        }
    }
}

impl From<&str> for ErrorReason {
    fn from(s: &str) -> Self {
        match s {
            "BadHeader" => Self::BadHeader,
            "NotFound" => Self::NotFound,
            "Busy" => Self::Busy,
            "NoSession" => Self::NoSession,
            "UnknownCommand" => Self::UnknownCommand,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an `ACK` acknowledges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ack {
    /// The chunk with this sequence number was received.
    Seq(u64),
    /// The downloading client is ready for the first chunk.
    Start,
    /// The end-of-stream marker was accepted.
    Eof,
}

/// A decoded wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Get { filename: String },
    Put { filename: String, size: u64 },
    /// Plain `OK`, answering a `PUT`.
    Accept,
    /// `OK|size|basename`, answering a `GET`.
    Offer { size: u64, basename: String },
    Error { reason: ErrorReason, detail: Option<String> },
    Data { seq: u64, payload: Vec<u8> },
    Ack(Ack),
    Eof { next_seq: u64 },
}

/// Why a datagram could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram is empty")]
    Empty,
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("unrecognized verb {0:?}")]
    Unrecognized(String),
    #[error("malformed {verb} message: {reason}")]
    Malformed { verb: Verb, reason: &'static str },
}

impl DecodeError {
    /// The verb of a malformed message, if the verb itself was recognized.
    pub fn verb(&self) -> Option<Verb> {
        match self {
            Self::Malformed { verb, .. } => Some(*verb),
            _ => None,
        }
    }
}

fn malformed(verb: Verb, reason: &'static str) -> DecodeError {
    DecodeError::Malformed { verb, reason }
}

fn parse_number(verb: Verb, field: &str, reason: &'static str) -> Result<u64, DecodeError> {
    // u64::from_str accepts a leading '+', the wire format does not
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(verb, reason));
    }
    field.parse().map_err(|_| malformed(verb, reason))
}

impl Message {
    pub fn ack(seq: u64) -> Self {
        Self::Ack(Ack::Seq(seq))
    }

    pub fn error(reason: ErrorReason) -> Self {
        Self::Error { reason, detail: None }
    }

    pub fn error_with_detail(reason: ErrorReason, detail: impl Into<String>) -> Self {
        Self::Error {
            reason,
            detail: Some(detail.into()),
        }
    }

    pub fn verb(&self) -> Verb {
        match self {
            Self::Get { .. } => Verb::Get,
            Self::Put { .. } => Verb::Put,
            Self::Accept | Self::Offer { .. } => Verb::Ok,
            Self::Error { .. } => Verb::Err,
            Self::Data { .. } => Verb::Data,
            Self::Ack(_) => Verb::Ack,
            Self::Eof { .. } => Verb::Eof,
        }
    }

    /// Encode into a datagram payload.
    ///
    /// Decoding gives back the same message as long as `PUT` carries a
    /// non-empty file name and `ERR` reasons contain no `|`.
    pub fn encode(&self) -> Vec<u8> {
        let text = match self {
            Self::Get { filename } => format!("GET|{filename}"),
            Self::Put { filename, size } => format!("PUT|{filename}|{size}"),
            Self::Accept => "OK".to_string(),
            Self::Offer { size, basename } => format!("OK|{size}|{basename}"),
            Self::Error { reason, detail: None } => format!("ERR|{reason}"),
            Self::Error {
                reason,
                detail: Some(detail),
            } => format!("ERR|{reason}|{detail}"),
            Self::Data { seq, payload } => format!("DAT|{seq}|{}", STANDARD.encode(payload)),
            Self::Ack(Ack::Seq(seq)) => format!("ACK|{seq}"),
            Self::Ack(Ack::Start) => "ACK|START".to_string(),
            Self::Ack(Ack::Eof) => "ACK|EOF".to_string(),
            Self::Eof { next_seq } => format!("EOF|{next_seq}"),
        };
        text.into_bytes()
    }

    /// Decode a datagram payload
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(buf).map_err(|_| DecodeError::NotUtf8)?;
        text.parse()
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (head, rest) = match text.split_once(DELIMITER) {
            Some((head, rest)) => (head, Some(rest)),
            None => (text, None),
        };
        let verb = Verb::from_str_opt(head).ok_or_else(|| DecodeError::Unrecognized(head.to_string()))?;

        match verb {
            Verb::Get => {
                let filename = rest.ok_or_else(|| malformed(verb, "missing filename"))?;
                Ok(Self::Get {
                    filename: filename.to_string(),
                })
            }
            Verb::Put => {
                // Split the size off the right so names containing '|' survive
                let (filename, size) = rest
                    .and_then(|r| r.rsplit_once(DELIMITER))
                    .ok_or_else(|| malformed(verb, "expected filename and size"))?;
                if filename.is_empty() {
                    return Err(malformed(verb, "empty filename"));
                }
                let size = parse_number(verb, size, "size is not a number")?;
                Ok(Self::Put {
                    filename: filename.to_string(),
                    size,
                })
            }
            Verb::Ok => match rest {
                None => Ok(Self::Accept),
                Some(rest) => {
                    let (size, basename) = rest
                        .split_once(DELIMITER)
                        .ok_or_else(|| malformed(verb, "expected size and basename"))?;
                    let size = parse_number(verb, size, "size is not a number")?;
                    Ok(Self::Offer {
                        size,
                        basename: basename.to_string(),
                    })
                }
            },
            Verb::Err => {
                let rest = rest.ok_or_else(|| malformed(verb, "missing reason"))?;
                let (reason, detail) = match rest.split_once(DELIMITER) {
                    Some((reason, detail)) => (reason, Some(detail.to_string())),
                    None => (rest, None),
                };
                if reason.is_empty() {
                    return Err(malformed(verb, "empty reason"));
                }
                Ok(Self::Error {
                    reason: ErrorReason::from(reason),
                    detail,
                })
            }
            Verb::Data => {
                let (seq, payload) = rest
                    .and_then(|r| r.split_once(DELIMITER))
                    .ok_or_else(|| malformed(verb, "expected seq and payload"))?;
                let seq = parse_number(verb, seq, "seq is not a number")?;
                let payload = STANDARD
                    .decode(payload)
                    .map_err(|_| malformed(verb, "payload is not valid base64"))?;
                Ok(Self::Data { seq, payload })
            }
            Verb::Ack => match rest {
                Some("START") => Ok(Self::Ack(Ack::Start)),
                Some("EOF") => Ok(Self::Ack(Ack::Eof)),
                Some(seq) => Ok(Self::ack(parse_number(verb, seq, "seq is not a number")?)),
                None => Err(malformed(verb, "missing seq")),
            },
            Verb::Eof => {
                let seq = rest.ok_or_else(|| malformed(verb, "missing seq"))?;
                Ok(Self::Eof {
                    next_seq: parse_number(verb, seq, "seq is not a number")?,
                })
            }
        }
    }
}

impl fmt::Display for Message {
    /// Log-friendly form. Never prints chunk payloads.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { seq, payload } => write!(f, "DAT|{}|<{} bytes>", seq, payload.len()),
            other => f.write_str(&String::from_utf8_lossy(&other.encode())),
        }
    }
}

/// Number of datagram bytes a `DAT` message needs for a chunk of `chunk_size` bytes
/// with a sequence number of up to `u64::MAX`, or `None` if that overflows `usize`.
pub fn data_datagram_len(chunk_size: usize) -> Option<usize> {
    let encoded = chunk_size.div_ceil(3).checked_mul(4)?;
    encoded.checked_add("DAT|".len() + u64::MAX.to_string().len() + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_str(s: &str) -> Result<Message, DecodeError> {
        Message::decode(s.as_bytes())
    }

    #[test]
    fn test_verb_names() {
        assert_eq!(Verb::Data.as_str(), "DAT");
        assert_eq!(Verb::from_str_opt("EOF"), Some(Verb::Eof));
        assert_eq!(Verb::from_str_opt("get"), None);
    }

    #[test]
    fn test_error_reason_tokens() {
        assert_eq!(ErrorReason::from("Busy"), ErrorReason::Busy);
        assert_eq!(
            ErrorReason::from("PermissionDenied"),
            ErrorReason::Other("PermissionDenied".to_string())
        );
        assert_eq!(ErrorReason::NoSession.to_string(), "NoSession");
    }

    #[test]
    fn test_other_reason_stays_one_field() {
        let reason = ErrorReason::other("a|b");
        assert_eq!(reason, ErrorReason::Other("a_b".to_string()));

        let message = Message::error(reason);
        assert_eq!(message.encode(), b"ERR|a_b");
        assert_eq!(Message::decode(&message.encode()), Ok(message));

        let with_detail = Message::error_with_detail(ErrorReason::other("Disk|Full"), "x|y");
        assert_eq!(Message::decode(&with_detail.encode()), Ok(with_detail));
    }

    #[test]
    fn test_encode_control_messages() {
        assert_eq!(Message::Get { filename: "a.txt".into() }.encode(), b"GET|a.txt");
        assert_eq!(
            Message::Put {
                filename: "a.txt".into(),
                size: 42
            }
            .encode(),
            b"PUT|a.txt|42"
        );
        assert_eq!(Message::Accept.encode(), b"OK");
        assert_eq!(
            Message::Offer {
                size: 7,
                basename: "b.bin".into()
            }
            .encode(),
            b"OK|7|b.bin"
        );
        assert_eq!(
            Message::error_with_detail(ErrorReason::NotFound, "missing.txt").encode(),
            b"ERR|NotFound|missing.txt"
        );
        assert_eq!(Message::Ack(Ack::Start).encode(), b"ACK|START");
        assert_eq!(Message::Ack(Ack::Eof).encode(), b"ACK|EOF");
        assert_eq!(Message::ack(3).encode(), b"ACK|3");
        assert_eq!(Message::Eof { next_seq: 4 }.encode(), b"EOF|4");
    }

    #[test]
    fn test_decode_control_messages() {
        assert_eq!(decode_str("OK"), Ok(Message::Accept));
        assert_eq!(
            decode_str("OK|1024|boot.img"),
            Ok(Message::Offer {
                size: 1024,
                basename: "boot.img".into()
            })
        );
        assert_eq!(decode_str("ERR|Busy"), Ok(Message::error(ErrorReason::Busy)));
        assert_eq!(decode_str("ACK|START"), Ok(Message::Ack(Ack::Start)));
        assert_eq!(decode_str("ACK|17"), Ok(Message::ack(17)));
        assert_eq!(decode_str("EOF|0"), Ok(Message::Eof { next_seq: 0 }));
    }

    #[test]
    fn test_binary_payload_survives() {
        let payload: Vec<u8> = (0..=255).collect();
        let encoded = Message::Data {
            seq: 9,
            payload: payload.clone(),
        }
        .encode();

        // Only the two delimiters after the verb and seq
        assert_eq!(encoded.iter().filter(|&&b| b == b'|').count(), 2);
        assert_eq!(Message::decode(&encoded), Ok(Message::Data { seq: 9, payload }));
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(
            decode_str("DAT|0|"),
            Ok(Message::Data {
                seq: 0,
                payload: Vec::new()
            })
        );
    }

    #[test]
    fn test_names_with_delimiters() {
        let put = Message::Put {
            filename: "odd|name".into(),
            size: 5,
        };
        assert_eq!(Message::decode(&put.encode()), Ok(put));

        let get = Message::Get {
            filename: "a|b|c".into(),
        };
        assert_eq!(Message::decode(&get.encode()), Ok(get));
    }

    #[test]
    fn test_unrecognized_verb() {
        assert_eq!(decode_str("HELLO|x"), Err(DecodeError::Unrecognized("HELLO".into())));
        assert_eq!(decode_str("hello"), Err(DecodeError::Unrecognized("hello".into())));
        assert_eq!(decode_str(""), Err(DecodeError::Empty));
        assert_eq!(Message::decode(&[0xff, 0xfe]), Err(DecodeError::NotUtf8));
    }

    #[test]
    fn test_malformed_fields() {
        for input in [
            "GET",
            "PUT|name",
            "PUT|name|big",
            "PUT||3",
            "PUT|name|-1",
            "OK|12",
            "OK|x|name",
            "ERR",
            "ERR|",
            "DAT|1",
            "DAT|one|AAAA",
            "DAT|1|not base64!",
            "ACK",
            "ACK|later",
            "EOF",
            "EOF|+3",
        ] {
            let err = decode_str(input).unwrap_err();
            assert!(
                matches!(err, DecodeError::Malformed { .. }),
                "{input:?} decoded to {err:?}"
            );
        }
        assert_eq!(decode_str("PUT|x|y").unwrap_err().verb(), Some(Verb::Put));
    }

    #[test]
    fn test_display_hides_payload() {
        let msg = Message::Data {
            seq: 2,
            payload: vec![1, 2, 3],
        };
        assert_eq!(msg.to_string(), "DAT|2|<3 bytes>");
        assert_eq!(Message::ack(2).to_string(), "ACK|2");
    }

    #[test]
    fn test_data_datagram_len() {
        assert!(data_datagram_len(1024).is_some_and(|len| len < 1500));
        assert!(data_datagram_len(48 * 1024).is_some_and(|len| len < MAX_DATAGRAM));
        assert_eq!(data_datagram_len(usize::MAX), None);
        assert_eq!(data_datagram_len(usize::MAX / 4 * 3), None);
    }
}
