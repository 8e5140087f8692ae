use crate::{flags::*, types::*};
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use num_traits::{FromPrimitive, ToPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

/// One parsed HTTP/2 frame. Transient: produced by `parse`, consumed
/// by the state machine or serialized by `encode_into`, never stored.
/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: StreamId,
        end_stream: bool,
        data: Bytes,
    },
    Headers {
        stream: StreamId,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: StreamId,
        priority: Priority,
    },
    ResetStream {
        stream: StreamId,
        error: ErrorType,
    },
    Settings {
        ack: bool,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: StreamId,
        promised: StreamId,
        end_headers: bool,
        fragment: Bytes,
    },
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
    Continuation {
        stream: StreamId,
        end_headers: bool,
        fragment: Bytes,
    },
    /// Foreign frame type; consumed and discarded (RFC 7540 §4.1).
    Unknown { typ: u8 },
}

impl Frame {
    /// Parse one frame off the front of `buf`. `Ok(None)` means the
    /// buffer does not yet hold the 9-byte header plus payload;
    /// nothing is consumed in that case.
    pub fn parse(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Self>, FrameError> {
        if buf.len() < FRAME_HEADER_LENGTH {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
        if length > max_frame_size as usize {
            return Err(FrameError::TooLong);
        }
        if buf.len() < FRAME_HEADER_LENGTH + length {
            return Ok(None);
        }

        let header = buf.split_to(FRAME_HEADER_LENGTH);
        let raw_type = header[3];
        let flags = header[4];
        // top bit of the stream id is reserved, masked on read
        let stream =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & (u32::MAX >> 1);
        let payload = buf.split_to(length).freeze();

        let Some(typ) = FrameType::from_u8(raw_type) else {
            trace!("discarding unknown frame type {raw_type:#x}");
            return Ok(Some(Self::Unknown { typ: raw_type }));
        };

        match typ {
            FrameType::Settings | FrameType::Ping | FrameType::GoAway => {
                if stream != 0 {
                    return Err(FrameError::NonZeroStreamId(typ));
                }
            }
            FrameType::WindowUpdate => {}
            _ => {
                if stream == 0 {
                    return Err(FrameError::ZeroStreamId(typ));
                }
            }
        }

        Ok(Some(match typ {
            FrameType::Data => {
                let flags = DataFlags::from_bits_truncate(flags);
                let data = strip_padding(typ, payload, flags.contains(DataFlags::PADDED))?;
                Self::Data {
                    stream,
                    end_stream: flags.contains(DataFlags::END_STREAM),
                    data,
                }
            }
            FrameType::Headers => {
                let flags = HeadersFlags::from_bits_truncate(flags);
                let mut fragment =
                    strip_padding(typ, payload, flags.contains(HeadersFlags::PADDED))?;
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    Some(take_priority(typ, &mut fragment)?)
                } else {
                    None
                };
                Self::Headers {
                    stream,
                    end_stream: flags.contains(HeadersFlags::END_STREAM),
                    end_headers: flags.contains(HeadersFlags::END_HEADERS),
                    priority,
                    fragment,
                }
            }
            FrameType::Priority => {
                let mut payload = payload;
                if payload.len() != 5 {
                    return Err(FrameError::PayloadLength(typ));
                }
                Self::Priority {
                    stream,
                    priority: take_priority(typ, &mut payload)?,
                }
            }
            FrameType::ResetStream => {
                if payload.len() != 4 {
                    return Err(FrameError::PayloadLength(typ));
                }
                Self::ResetStream {
                    stream,
                    error: parse_error_code(&payload[0..4]),
                }
            }
            FrameType::Settings => {
                let flags = SettingsFlags::from_bits_truncate(flags);
                if flags.contains(SettingsFlags::ACK) {
                    if !payload.is_empty() {
                        return Err(FrameError::NonEmptySettingsAck);
                    }
                    Self::Settings {
                        ack: true,
                        params: Vec::new(),
                    }
                } else {
                    if payload.len() % 6 != 0 {
                        return Err(FrameError::PayloadLength(typ));
                    }
                    let mut params = Vec::with_capacity(payload.len() / 6);
                    for chunk in payload.chunks(6) {
                        // unwrap: chunk slices are exactly 2 and 4 bytes
                        let id = u16::from_be_bytes(chunk[0..2].try_into().unwrap());
                        let value = u32::from_be_bytes(chunk[2..6].try_into().unwrap());
                        // unknown settings are ignored, RFC 7540 §6.5.2
                        let Some(param) = SettingsParameter::from_u16(id) else {
                            trace!("ignoring unknown setting {id:#x}={value}");
                            continue;
                        };
                        validate_setting(param, value)?;
                        params.push((param, value));
                    }
                    Self::Settings { ack: false, params }
                }
            }
            FrameType::PushPromise => {
                let flags = PushPromiseFlags::from_bits_truncate(flags);
                let mut fragment =
                    strip_padding(typ, payload, flags.contains(PushPromiseFlags::PADDED))?;
                if fragment.len() < 4 {
                    return Err(FrameError::PayloadLength(typ));
                }
                let id = fragment.split_to(4);
                // unwrap: the length of the slice is always 4
                let promised =
                    u32::from_be_bytes(id[..].try_into().unwrap()) & (u32::MAX >> 1);
                Self::PushPromise {
                    stream,
                    promised,
                    end_headers: flags.contains(PushPromiseFlags::END_HEADERS),
                    fragment,
                }
            }
            FrameType::Ping => {
                if payload.len() != 8 {
                    return Err(FrameError::PayloadLength(typ));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Self::Ping {
                    ack: PingFlags::from_bits_truncate(flags).contains(PingFlags::ACK),
                    data,
                }
            }
            FrameType::GoAway => {
                if payload.len() < 8 {
                    return Err(FrameError::PayloadLength(typ));
                }
                // unwrap: the length of the slice is always 4
                let last_stream = u32::from_be_bytes(payload[0..4].try_into().unwrap())
                    & (u32::MAX >> 1);
                Self::GoAway {
                    last_stream,
                    error: parse_error_code(&payload[4..8]),
                    debug: payload.slice(8..),
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameError::PayloadLength(typ));
                }
                // unwrap: the length of the slice is always 4
                let increment = u32::from_be_bytes(payload[0..4].try_into().unwrap())
                    & (u32::MAX >> 1);
                if increment == 0 {
                    return Err(FrameError::ZeroWindowIncrement);
                }
                Self::WindowUpdate { stream, increment }
            }
            FrameType::Continuation => Self::Continuation {
                stream,
                end_headers: ContinuationFlags::from_bits_truncate(flags)
                    .contains(ContinuationFlags::END_HEADERS),
                fragment: payload,
            },
        }))
    }

    /// Serialize into `buf`. `padding` adds that many zero bytes to
    /// DATA and HEADERS frames, declared via the PADDED flag; other
    /// types ignore it.
    pub fn encode_into(&self, padding: u8, buf: &mut BytesMut) {
        match self {
            Self::Data {
                stream,
                end_stream,
                data,
            } => {
                let mut flags = DataFlags::empty();
                if *end_stream {
                    flags |= DataFlags::END_STREAM;
                }
                if padding > 0 {
                    flags |= DataFlags::PADDED;
                }
                put_header(
                    buf,
                    padded_len(data.len(), padding),
                    FrameType::Data,
                    flags.bits(),
                    *stream,
                );
                put_padded(buf, data, padding);
            }
            Self::Headers {
                stream,
                end_stream,
                end_headers,
                priority,
                fragment,
            } => {
                let mut flags = HeadersFlags::empty();
                if *end_stream {
                    flags |= HeadersFlags::END_STREAM;
                }
                if *end_headers {
                    flags |= HeadersFlags::END_HEADERS;
                }
                if priority.is_some() {
                    flags |= HeadersFlags::PRIORITY;
                }
                if padding > 0 {
                    flags |= HeadersFlags::PADDED;
                }
                let priority_len = if priority.is_some() { 5 } else { 0 };
                put_header(
                    buf,
                    padded_len(fragment.len() + priority_len, padding),
                    FrameType::Headers,
                    flags.bits(),
                    *stream,
                );
                if padding > 0 {
                    buf.put_u8(padding);
                }
                if let Some(priority) = priority {
                    put_priority(buf, *priority);
                }
                buf.put_slice(fragment);
                buf.put_bytes(0, usize::from(padding));
            }
            Self::Priority { stream, priority } => {
                put_header(buf, 5, FrameType::Priority, 0, *stream);
                put_priority(buf, *priority);
            }
            Self::ResetStream { stream, error } => {
                put_header(buf, 4, FrameType::ResetStream, 0, *stream);
                // unwrap: ErrorType is repr(u32)
                buf.put_u32(error.to_u32().unwrap());
            }
            Self::Settings { ack, params } => {
                let flags = if *ack { SettingsFlags::ACK.bits() } else { 0 };
                put_header(buf, params.len() * 6, FrameType::Settings, flags, 0);
                for (param, value) in params {
                    // unwrap: SettingsParameter is repr(u16)
                    buf.put_u16(param.to_u16().unwrap());
                    buf.put_u32(*value);
                }
            }
            Self::PushPromise {
                stream,
                promised,
                end_headers,
                fragment,
            } => {
                let mut flags = PushPromiseFlags::empty();
                if *end_headers {
                    flags |= PushPromiseFlags::END_HEADERS;
                }
                put_header(
                    buf,
                    fragment.len() + 4,
                    FrameType::PushPromise,
                    flags.bits(),
                    *stream,
                );
                buf.put_u32(promised & (u32::MAX >> 1));
                buf.put_slice(fragment);
            }
            Self::Ping { ack, data } => {
                let flags = if *ack { PingFlags::ACK.bits() } else { 0 };
                put_header(buf, 8, FrameType::Ping, flags, 0);
                buf.put_slice(data);
            }
            Self::GoAway {
                last_stream,
                error,
                debug,
            } => {
                put_header(buf, 8 + debug.len(), FrameType::GoAway, 0, 0);
                buf.put_u32(last_stream & (u32::MAX >> 1));
                // unwrap: ErrorType is repr(u32)
                buf.put_u32(error.to_u32().unwrap());
                buf.put_slice(debug);
            }
            Self::WindowUpdate { stream, increment } => {
                put_header(buf, 4, FrameType::WindowUpdate, 0, *stream);
                buf.put_u32(increment & (u32::MAX >> 1));
            }
            Self::Continuation {
                stream,
                end_headers,
                fragment,
            } => {
                let flags = if *end_headers {
                    ContinuationFlags::END_HEADERS.bits()
                } else {
                    0
                };
                put_header(
                    buf,
                    fragment.len(),
                    FrameType::Continuation,
                    flags,
                    *stream,
                );
                buf.put_slice(fragment);
            }
            Self::Unknown { .. } => {}
        }
    }
}

fn put_header(buf: &mut BytesMut, length: usize, typ: FrameType, flags: u8, stream: StreamId) {
    buf.put_uint(length as u64, 3);
    // unwrap: FrameType is repr(u8)
    buf.put_u8(typ.to_u8().unwrap());
    buf.put_u8(flags);
    // reserved bit is always written as zero
    buf.put_u32(stream & (u32::MAX >> 1));
}

fn put_priority(buf: &mut BytesMut, priority: Priority) {
    let mut dependency = priority.dependency & (u32::MAX >> 1);
    if priority.exclusive {
        dependency |= 1 << 31;
    }
    buf.put_u32(dependency);
    buf.put_u8(priority.weight);
}

fn padded_len(payload: usize, padding: u8) -> usize {
    if padding > 0 {
        payload + 1 + usize::from(padding)
    } else {
        payload
    }
}

fn put_padded(buf: &mut BytesMut, payload: &[u8], padding: u8) {
    if padding > 0 {
        buf.put_u8(padding);
    }
    buf.put_slice(payload);
    buf.put_bytes(0, usize::from(padding));
}

fn strip_padding(typ: FrameType, mut payload: Bytes, padded: bool) -> Result<Bytes, FrameError> {
    if !padded {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameError::PayloadLength(typ));
    }
    let pad = usize::from(payload[0]);
    if pad >= payload.len() {
        return Err(FrameError::InvalidPadding);
    }
    payload.truncate(payload.len() - pad);
    Ok(payload.slice(1..))
}

fn take_priority(typ: FrameType, payload: &mut Bytes) -> Result<Priority, FrameError> {
    if payload.len() < 5 {
        return Err(FrameError::PayloadLength(typ));
    }
    let head = payload.split_to(5);
    // unwrap: the length of the slice is always 4
    let raw = u32::from_be_bytes(head[0..4].try_into().unwrap());
    Ok(Priority {
        dependency: raw & (u32::MAX >> 1),
        exclusive: raw & (1 << 31) != 0,
        weight: head[4],
    })
}

fn parse_error_code(bytes: &[u8]) -> ErrorType {
    // unwrap: the length of the slice is always 4
    let code = u32::from_be_bytes(bytes.try_into().unwrap());
    // unknown codes are treated as an internal error, RFC 7540 §7
    ErrorType::from_u32(code).unwrap_or(ErrorType::InternalError)
}

fn validate_setting(param: SettingsParameter, value: u32) -> Result<(), FrameError> {
    match param {
        SettingsParameter::EnablePush if value > 1 => Err(FrameError::InvalidEnablePush(value)),
        SettingsParameter::MaxFrameSize
            if !(DEFAULT_MAX_FRAME_SIZE..=(1 << 24) - 1).contains(&value) =>
        {
            Err(FrameError::InvalidMaxFrameSize(value))
        }
        SettingsParameter::InitialWindowSize if value > u32::MAX >> 1 => {
            Err(FrameError::InvalidWindowSize(value))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(bytes: &[u8]) -> Result<Option<Frame>, FrameError> {
        let mut buf = BytesMut::from(bytes);
        Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE)
    }

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode_into(0, &mut buf);
        let wire = buf.clone();
        let parsed = Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, frame);
        assert!(buf.is_empty());
        // and the re-encoding is byte-identical
        let mut again = BytesMut::new();
        parsed.encode_into(0, &mut again);
        assert_eq!(again, wire);
    }

    #[test]
    fn needs_more_bytes() {
        assert_eq!(parse_one(&[0, 0, 5, 0, 0]).unwrap(), None);
        // header present, payload truncated
        assert_eq!(
            parse_one(&[0, 0, 5, 0, 1, 0, 0, 0, 1, b'h', b'i']).unwrap(),
            None
        );
    }

    #[test]
    fn roundtrips() {
        roundtrip(Frame::Data {
            stream: 1,
            end_stream: true,
            data: Bytes::from_static(b"hello"),
        });
        roundtrip(Frame::Headers {
            stream: 3,
            end_stream: false,
            end_headers: true,
            priority: Some(Priority {
                dependency: 1,
                exclusive: true,
                weight: 16,
            }),
            fragment: Bytes::from_static(b"\x82"),
        });
        roundtrip(Frame::Priority {
            stream: 5,
            priority: Priority {
                dependency: 3,
                exclusive: false,
                weight: 0,
            },
        });
        roundtrip(Frame::ResetStream {
            stream: 1,
            error: ErrorType::Cancel,
        });
        roundtrip(Frame::Settings {
            ack: false,
            params: vec![
                (SettingsParameter::MaxConcurrentStreams, 100),
                (SettingsParameter::InitialWindowSize, 65_535),
            ],
        });
        roundtrip(Frame::PushPromise {
            stream: 1,
            promised: 2,
            end_headers: true,
            fragment: Bytes::from_static(b"\x82"),
        });
        roundtrip(Frame::Ping {
            ack: true,
            data: *b"12345678",
        });
        roundtrip(Frame::GoAway {
            last_stream: 7,
            error: ErrorType::ProtocolError,
            debug: Bytes::from_static(b"debug"),
        });
        roundtrip(Frame::WindowUpdate {
            stream: 0,
            increment: 1024,
        });
        roundtrip(Frame::Continuation {
            stream: 1,
            end_headers: true,
            fragment: Bytes::from_static(b"\x82"),
        });
    }

    #[test]
    fn reserved_stream_bit_masked() {
        let frame = parse_one(&[0, 0, 1, 0, 0, 0x80, 0, 0, 1, b'x'])
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream: 1,
                end_stream: false,
                data: Bytes::from_static(b"x"),
            }
        );
    }

    #[test]
    fn data_padding_stripped() {
        // PADDED flag, pad length 2
        let frame = parse_one(&[0, 0, 6, 0, 0x8, 0, 0, 0, 1, 2, b'h', b'i', b'!', 0, 0])
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream: 1,
                end_stream: false,
                data: Bytes::from_static(b"hi!"),
            }
        );
        // padding that swallows the payload is rejected
        assert_eq!(
            parse_one(&[0, 0, 2, 0, 0x8, 0, 0, 0, 1, 5, 0]),
            Err(FrameError::InvalidPadding)
        );
    }

    #[test]
    fn stream_id_rules() {
        assert_eq!(
            parse_one(&[0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(FrameError::ZeroStreamId(FrameType::Data))
        );
        assert_eq!(
            parse_one(&[0, 0, 0, 4, 0, 0, 0, 0, 1]),
            Err(FrameError::NonZeroStreamId(FrameType::Settings))
        );
        assert_eq!(
            parse_one(&[0, 0, 8, 6, 0, 0, 0, 0, 3, 1, 2, 3, 4, 5, 6, 7, 8]),
            Err(FrameError::NonZeroStreamId(FrameType::Ping))
        );
    }

    #[test]
    fn settings_length_must_be_multiple_of_six() {
        let err = parse_one(&[0, 0, 5, 4, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5]).unwrap_err();
        assert_eq!(err, FrameError::PayloadLength(FrameType::Settings));
        assert_eq!(err.error_type(), ErrorType::FrameSizeError);
    }

    #[test]
    fn settings_value_validation() {
        // MAX_FRAME_SIZE = 16383
        let err = parse_one(&[0, 0, 6, 4, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0x3f, 0xff]).unwrap_err();
        assert_eq!(err, FrameError::InvalidMaxFrameSize(16_383));
        assert_eq!(err.error_type(), ErrorType::ProtocolError);
        // ENABLE_PUSH = 2
        assert_eq!(
            parse_one(&[0, 0, 6, 4, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 2]),
            Err(FrameError::InvalidEnablePush(2))
        );
        // INITIAL_WINDOW_SIZE = 2^31
        let err =
            parse_one(&[0, 0, 6, 4, 0, 0, 0, 0, 0, 0, 4, 0x80, 0, 0, 0]).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::FlowControlError);
    }

    #[test]
    fn unknown_settings_ignored() {
        let frame = parse_one(&[0, 0, 6, 4, 0, 0, 0, 0, 0, 0, 0x99, 0, 0, 0, 7])
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            Frame::Settings {
                ack: false,
                params: Vec::new(),
            }
        );
    }

    #[test]
    fn settings_ack_with_payload_rejected() {
        assert_eq!(
            parse_one(&[0, 0, 6, 4, 1, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]),
            Err(FrameError::NonEmptySettingsAck)
        );
    }

    #[test]
    fn fixed_length_payloads_enforced() {
        assert_eq!(
            parse_one(&[0, 0, 7, 6, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7]),
            Err(FrameError::PayloadLength(FrameType::Ping))
        );
        assert_eq!(
            parse_one(&[0, 0, 3, 3, 0, 0, 0, 0, 1, 0, 0, 8]),
            Err(FrameError::PayloadLength(FrameType::ResetStream))
        );
        assert_eq!(
            parse_one(&[0, 0, 4, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(FrameError::PayloadLength(FrameType::GoAway))
        );
    }

    #[test]
    fn unknown_frame_type_discarded() {
        let mut buf = BytesMut::from(&[0, 0, 2, 0xee, 0, 0, 0, 0, 0, 1, 2][..]);
        assert_eq!(
            Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::Unknown { typ: 0xee })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 1][..]);
        assert_eq!(
            Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE),
            Err(FrameError::TooLong)
        );
    }

    #[test]
    fn zero_window_increment_rejected() {
        assert_eq!(
            parse_one(&[0, 0, 4, 8, 0, 0, 0, 0, 1, 0, 0, 0, 0]),
            Err(FrameError::ZeroWindowIncrement)
        );
    }

    #[test]
    fn padded_encode_declares_flag() {
        let frame = Frame::Data {
            stream: 1,
            end_stream: false,
            data: Bytes::from_static(b"ab"),
        };
        let mut buf = BytesMut::new();
        frame.encode_into(3, &mut buf);
        assert_eq!(
            &buf[..],
            &[0, 0, 6, 0, 0x8, 0, 0, 0, 1, 3, b'a', b'b', 0, 0, 0][..]
        );
        let parsed = Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, frame);
    }
}
