use enum_map::{enum_map, EnumMap};
use num_derive::{FromPrimitive, ToPrimitive};
use std::time::Duration;

/// 31-bit stream identifier; odd ids are client-initiated, even ids
/// server-initiated, 0 is the connection itself.
pub type StreamId = u32;

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// What remains of the preface once the request-line parser has
/// consumed `PRI * HTTP/2.0\r\n`.
pub const PREFACE_TAIL: &[u8] = b"\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LENGTH: usize = 9;

/// Longest CRLF-terminated line (terminator included) accepted by the
/// textual states; overflow maps to 414 or 431 depending on context.
pub const MAX_LINE_LENGTH: usize = 8192;

pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Closed streams stay resolvable for this long before the sweep
/// evicts them; the sweep itself runs no more often than this.
pub const STREAM_RETENTION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum HttpVersion {
    #[display(fmt = "HTTP/1.0")]
    Http10,
    #[display(fmt = "HTTP/1.1")]
    Http11,
    #[display(fmt = "HTTP/2.0")]
    Http2,
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// Graceful shutdown or no error at all.
    NoError = 0x0,
    /// Unspecific protocol violation.
    ProtocolError = 0x1,
    /// The endpoint encountered an unexpected internal error.
    InternalError = 0x2,
    /// The peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// SETTINGS was not acknowledged in a timely manner.
    SettingsTimeout = 0x4,
    /// Frame received after a stream was half-closed.
    StreamClosed = 0x5,
    /// Frame with an invalid size.
    FrameSizeError = 0x6,
    /// Stream refused before any application processing.
    RefusedStream = 0x7,
    /// The stream is no longer needed.
    Cancel = 0x8,
    /// Header compression context can no longer be maintained.
    CompressionError = 0x9,
    /// A CONNECT tunnel was reset or abnormally closed.
    ConnectError = 0xa,
    /// The peer is generating excessive load.
    EnhanceYourCalm = 0xb,
    /// Transport properties below minimum security requirements.
    InadequateSecurity = 0xc,
    /// The endpoint requires HTTP/1.1 instead of HTTP/2.
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    /// Maximum size of the header compression table used to decode
    /// header blocks, in octets. Initial value 4,096.
    HeaderTableSize = 0x1,
    /// Server push permitted iff 1; any other value is a
    /// PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams the sender will allow.
    /// Initially unlimited.
    MaxConcurrentStreams = 0x3,
    /// Initial window size for stream-level flow control. Values above
    /// 2^31-1 are a FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive; must
    /// stay within [2^14, 2^24-1].
    MaxFrameSize = 0x5,
    /// Advisory cap on the uncompressed header list size. Initially
    /// unlimited.
    MaxHeaderListSize = 0x6,
}

/// One settings table per direction; `u32::MAX` stands in for the
/// unlimited defaults.
pub type Settings = EnumMap<SettingsParameter, u32>;

pub fn default_settings() -> Settings {
    enum_map! {
        SettingsParameter::HeaderTableSize => DEFAULT_HEADER_TABLE_SIZE,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => DEFAULT_WINDOW_SIZE,
        SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

/// Per-connection tunables. `settings` is what this endpoint enforces
/// and would advertise; peer settings live on the connection and only
/// ever come off the wire.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    /// Zero padding appended to outbound DATA/HEADERS frames (0-255).
    pub frame_padding: u8,
    pub stream_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: default_settings(),
            frame_padding: 0,
            stream_retention: STREAM_RETENTION,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload exceeds maximum frame size")]
    TooLong,
    #[error("payload length invalid for {0:?} frame")]
    PayloadLength(FrameType),
    #[error("unexpected stream id 0 on {0:?} frame")]
    ZeroStreamId(FrameType),
    #[error("unexpected non-zero stream id on {0:?} frame")]
    NonZeroStreamId(FrameType),
    #[error("SETTINGS ack with non-empty payload")]
    NonEmptySettingsAck,
    #[error("ENABLE_PUSH value {0} not in {{0,1}}")]
    InvalidEnablePush(u32),
    #[error("MAX_FRAME_SIZE value {0} out of range")]
    InvalidMaxFrameSize(u32),
    #[error("INITIAL_WINDOW_SIZE value {0} exceeds 2^31-1")]
    InvalidWindowSize(u32),
    #[error("padding length covers the whole payload")]
    InvalidPadding,
    #[error("WINDOW_UPDATE with zero increment")]
    ZeroWindowIncrement,
}

impl FrameError {
    /// Wire error code this decode failure maps to on GOAWAY.
    pub fn error_type(self) -> ErrorType {
        match self {
            Self::TooLong | Self::PayloadLength(_) | Self::NonEmptySettingsAck => {
                ErrorType::FrameSizeError
            }
            Self::InvalidWindowSize(_) => ErrorType::FlowControlError,
            _ => ErrorType::ProtocolError,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown or closed stream {0}")]
pub struct UnknownStream(pub StreamId);
