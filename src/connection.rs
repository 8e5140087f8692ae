use crate::{
    frame::Frame,
    headers::{latin1_to_string, normalize_value, parse_field_line, Headers},
    hpack::HeaderCodec,
    line::{next_line, strip_crlf, LineOverflow},
    request::{parse_request_line, ParsedRequestLine, RequestLine, RequestLineError},
    response,
    stream::Stream,
    types::*,
};
use bytes::{Buf, Bytes, BytesMut};
use derivative::Derivative;
use log::{debug, error, trace, warn};
use std::{
    collections::{HashMap, HashSet},
    mem,
    time::Instant,
};

/// Events delivered to the application, in order per stream:
/// `Headers`, zero or more `Body`, an optional `Trailers`, then `End`.
/// `Reset`/`GoAway` interrupt that sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Complete request header section. HTTP/1 requests arrive in the
    /// same shape as HTTP/2: `:method`/`:scheme`/`:path` pseudo-headers
    /// first, then the regular fields.
    Headers {
        stream: StreamId,
        headers: Headers,
        end_stream: bool,
    },
    Body {
        stream: StreamId,
        data: Bytes,
    },
    Trailers {
        stream: StreamId,
        headers: Headers,
    },
    End {
        stream: StreamId,
    },
    Reset {
        stream: StreamId,
        error: ErrorType,
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
    },
    /// Opaque bytes once the connection has switched to a WebSocket
    /// sink; framing is the application's concern.
    WebSocketData {
        stream: StreamId,
        data: Bytes,
    },
}

/// Exactly one of the textual or binary state families is active at
/// any moment; WEBSOCKET consumes everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Header,
    Body,
    BodyChunkedSize,
    BodyChunkedData,
    BodyChunkedTrailer,
    BodyUntilClose,
    Pri,
    PriSettings,
    Http2,
    Http2Continuation,
    Websocket,
    Closed,
}

/// Per-connection protocol state machine: bytes in via `receive`,
/// events out, response bytes accumulated in an outbox the transport
/// drains with `take_output`. Single-owner; the I/O worker that owns
/// the connection serializes all access.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Connection {
    config: Config,
    state: State,
    version: HttpVersion,
    secure: bool,

    pub(crate) streams: HashMap<StreamId, Stream>,
    pub(crate) active_streams: HashSet<StreamId>,
    #[derivative(Debug = "ignore")]
    pub(crate) codec: Option<HeaderCodec>,
    pub(crate) peer_settings: Settings,

    /// Next synthesized odd id for HTTP/1 requests.
    next_h1_stream: StreamId,
    /// Highest client stream id seen; HTTP/2 ids must exceed it.
    last_client_stream: StreamId,
    /// Next even id for server-initiated streams.
    server_stream_id: StreamId,

    continuation_stream: StreamId,
    continuation_end_stream: bool,
    /// The open header block belongs to a refused or closed stream;
    /// it still has to reach the HPACK decoder to keep the
    /// compression context in sync, but the result is dropped.
    continuation_discard: bool,
    discard_fragment: BytesMut,
    h2c_upgrade_pending: bool,
    websocket_stream: Option<StreamId>,
    preface_expected: &'static [u8],
    preface_optional: bool,
    server_preface_sent: bool,
    goaway_sent: bool,
    goaway_received: bool,

    last_cleanup: Instant,
    pub(crate) frame_padding: u8,
    pub(crate) conn_send_window: i64,

    /// HTTP/1 stream currently being parsed.
    current_stream: StreamId,
    chunk_remaining: usize,
    trailer_headers: Headers,

    read_buf: BytesMut,
    pub(crate) outbox: BytesMut,
    pub(crate) close_after_flush: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Connection {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let frame_padding = config.frame_padding;
        Self {
            config,
            state: State::RequestLine,
            version: HttpVersion::Http11,
            secure: false,
            streams: HashMap::new(),
            active_streams: HashSet::new(),
            codec: None,
            peer_settings: default_settings(),
            next_h1_stream: 1,
            last_client_stream: 0,
            server_stream_id: 2,
            continuation_stream: 0,
            continuation_end_stream: false,
            continuation_discard: false,
            discard_fragment: BytesMut::new(),
            h2c_upgrade_pending: false,
            websocket_stream: None,
            preface_expected: PREFACE_TAIL,
            preface_optional: false,
            server_preface_sent: false,
            goaway_sent: false,
            goaway_received: false,
            last_cleanup: Instant::now(),
            frame_padding,
            conn_send_window: i64::from(DEFAULT_WINDOW_SIZE),
            current_stream: 0,
            chunk_remaining: 0,
            trailer_headers: Headers::new(),
            read_buf: BytesMut::with_capacity(8192),
            outbox: BytesMut::with_capacity(8192),
            close_after_flush: false,
        }
    }

    /// TLS handshake finished; `alpn_protocol` is the negotiated token
    /// (`b"h2"`, `b"http/1.1"`, or none). ALPN `h2` enters the binary
    /// family directly: the server preface goes out first and a client
    /// preface is consumed if it shows up, ignored otherwise.
    pub fn security_established(&mut self, alpn_protocol: Option<&[u8]>) {
        self.secure = true;
        match alpn_protocol {
            Some(proto) if proto == b"h2" => {
                debug!("ALPN h2");
                self.enter_h2(CONNECTION_PREFACE, true);
            }
            Some(other) => {
                trace!("ALPN {:?}", String::from_utf8_lossy(other));
            }
            None => {}
        }
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// The transport should close once queued output has drained.
    pub fn wants_close(&self) -> bool {
        self.close_after_flush
    }

    /// Drain bytes queued for the transport.
    pub fn take_output(&mut self) -> Option<Bytes> {
        if self.outbox.is_empty() {
            None
        } else {
            Some(self.outbox.split().freeze())
        }
    }

    pub fn set_frame_padding(&mut self, padding: u8) {
        self.frame_padding = padding;
    }

    /// Consume as much of `data` as the current state permits and
    /// report the stream events it produced.
    pub fn receive(&mut self, data: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        if self.state == State::Closed {
            trace!("discarding {} bytes on closed connection", data.len());
            return events;
        }
        self.read_buf.extend_from_slice(data);
        loop {
            let more = match self.state {
                State::RequestLine => self.on_request_line(),
                State::Header => self.on_header(&mut events),
                State::Body => self.on_body(&mut events),
                State::BodyChunkedSize => self.on_chunk_size(),
                State::BodyChunkedData => self.on_chunk_data(&mut events),
                State::BodyChunkedTrailer => self.on_chunk_trailer(&mut events),
                State::BodyUntilClose => self.on_body_until_close(&mut events),
                State::Pri => self.on_pri(),
                State::PriSettings => self.on_pri_settings(),
                State::Http2 => self.on_http2(&mut events),
                State::Http2Continuation => self.on_http2_continuation(&mut events),
                State::Websocket => self.on_websocket(&mut events),
                State::Closed => false,
            };
            if !more {
                break;
            }
        }
        events
    }

    /// Transport reported the peer went away.
    pub fn disconnected(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        let now = Instant::now();
        // read-until-close bodies complete at disconnect
        if self.state == State::BodyUntilClose {
            let id = self.current_stream;
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.end_stream_received = true;
                if stream.reject_status.is_none() {
                    events.push(Event::End { stream: id });
                }
            }
        }
        for id in mem::take(&mut self.active_streams) {
            if let Some(stream) = self.streams.get_mut(&id) {
                if !stream.closed {
                    stream.close(now);
                    if stream.headers_frozen() && !stream.end_stream_received {
                        events.push(Event::Reset {
                            stream: id,
                            error: ErrorType::Cancel,
                        });
                    }
                }
            }
        }
        self.state = State::Closed;
        events
    }

    /// Transport-level failure: immediate cleanup, same notifications
    /// as a disconnect.
    pub fn transport_error(&mut self) -> Vec<Event> {
        error!("transport error, closing connection");
        self.disconnected()
    }

    /// Graceful shutdown: GOAWAY(NO_ERROR); streams at or below the
    /// last accepted id may still complete.
    pub fn shutdown(&mut self) {
        if self.version == HttpVersion::Http2 && !self.goaway_sent {
            Frame::GoAway {
                last_stream: self.last_client_stream,
                error: ErrorType::NoError,
                debug: Bytes::new(),
            }
            .encode_into(0, &mut self.outbox);
        }
        self.goaway_sent = true;
        if self.active_streams.is_empty() {
            self.close_after_flush = true;
            self.state = State::Closed;
        }
    }

    /// Response surface for a live stream.
    pub fn respond(&mut self, stream: StreamId) -> Result<response::ResponseHandle<'_>, UnknownStream> {
        self.maybe_sweep(Instant::now());
        match self.streams.get(&stream) {
            Some(s) if !s.closed => Ok(response::ResponseHandle::new(self, stream)),
            _ => Err(UnknownStream(stream)),
        }
    }

    /// Minimal status-only response on `stream`.
    pub fn send_error(&mut self, stream: StreamId, status: u16) -> Result<(), UnknownStream> {
        if !self.streams.contains_key(&stream) {
            return Err(UnknownStream(stream));
        }
        response::send_simple_status(self, stream, status);
        Ok(())
    }

    /// Announce a server-initiated stream associated with `parent`.
    /// `None` when the peer disabled push or the parent is gone; a
    /// promised id is always even. The response goes out through
    /// `respond(promised_id)`.
    pub fn push_promise(&mut self, parent: StreamId, request_headers: &Headers) -> Option<StreamId> {
        if self.version != HttpVersion::Http2 {
            return None;
        }
        if self.peer_settings[SettingsParameter::EnablePush] != 1 {
            debug!("push refused: peer disabled ENABLE_PUSH");
            return None;
        }
        if !self.streams.get(&parent).map_or(false, |s| !s.closed) {
            return None;
        }
        let block = self
            .codec
            .as_mut()?
            .encode(request_headers.iter());
        let promised = self.server_stream_id;
        self.server_stream_id += 2;
        let now = Instant::now();
        let window = self.peer_settings[SettingsParameter::InitialWindowSize];
        let mut stream = Stream::new(promised, window, now);
        stream.push_promise = true;
        // promised requests never carry a body
        stream.end_stream_received = true;
        self.streams.insert(promised, stream);
        self.active_streams.insert(promised);
        Frame::PushPromise {
            stream: parent,
            promised,
            end_headers: true,
            fragment: block.into(),
        }
        .encode_into(0, &mut self.outbox);
        debug!("promised stream {promised} for {parent}");
        Some(promised)
    }

    /// Put the connection into the WebSocket sink state after a
    /// successful upgrade response; subsequent bytes surface as
    /// `WebSocketData` on `stream`.
    pub fn enable_websocket(&mut self, stream: StreamId) -> Result<(), UnknownStream> {
        if !self.streams.contains_key(&stream) {
            return Err(UnknownStream(stream));
        }
        self.websocket_stream = Some(stream);
        if self.version != HttpVersion::Http2 {
            self.state = State::Websocket;
        }
        Ok(())
    }

    // ---- textual states -------------------------------------------------

    fn on_request_line(&mut self) -> bool {
        let line = match next_line(&mut self.read_buf) {
            Err(LineOverflow) => {
                warn!("request line overflow");
                self.fatal_h1_status(414);
                return false;
            }
            Ok(None) => return false,
            Ok(Some(line)) => line,
        };
        if strip_crlf(&line).is_empty() {
            // tolerate blank lines between requests
            return true;
        }
        match parse_request_line(&line) {
            Ok(ParsedRequestLine::PrefaceStart) => {
                debug!("HTTP/2 prior knowledge preface");
                self.enter_h2(PREFACE_TAIL, false);
                true
            }
            Ok(ParsedRequestLine::Request(request)) => {
                self.begin_h1_request(request);
                true
            }
            Err(RequestLineError::BadVersion) => {
                self.fatal_h1_status(505);
                false
            }
            Err(err) => {
                warn!("bad request line: {err}");
                self.fatal_h1_status(400);
                false
            }
        }
    }

    fn begin_h1_request(&mut self, request: RequestLine) {
        let now = Instant::now();
        self.maybe_sweep(now);
        let id = self.next_h1_stream;
        self.next_h1_stream += 2;
        self.last_client_stream = id;

        let window = self.peer_settings[SettingsParameter::InitialWindowSize];
        let mut stream = Stream::new(id, window, now);
        if request.version == HttpVersion::Http10 {
            stream.close_connection = true;
        }
        if !request.method.is_supported() {
            stream.reject_status = Some(501);
        }
        // the request line becomes pseudo-headers, same shape as HTTP/2
        let scheme = if self.secure { "https" } else { "http" };
        let _ = stream.add_header(":method", request.method.to_string());
        let _ = stream.add_header(":scheme", scheme);
        let _ = stream.add_header(":path", request.target);

        trace!("request line -> stream {id} ({})", request.version);
        self.version = request.version;
        self.current_stream = id;
        self.streams.insert(id, stream);
        self.active_streams.insert(id);
        self.state = State::Header;
    }

    fn on_header(&mut self, events: &mut Vec<Event>) -> bool {
        let line = match next_line(&mut self.read_buf) {
            Err(LineOverflow) => {
                warn!("header line overflow");
                self.fatal_h1_status(431);
                return false;
            }
            Ok(None) => return false,
            Ok(Some(line)) => line,
        };
        let raw = strip_crlf(&line);
        if raw.is_empty() {
            return self.finish_h1_headers(events);
        }
        let Some(stream) = self.streams.get_mut(&self.current_stream) else {
            self.fatal_h1_status(400);
            return false;
        };
        if raw[0] == b' ' || raw[0] == b'\t' {
            // obs-fold continuation: append with a single space
            let text = normalize_value(&latin1_to_string(raw));
            if stream.extend_last_header(&text).is_err() {
                self.fatal_h1_status(400);
                return false;
            }
            return true;
        }
        match parse_field_line(raw) {
            Ok((name, value)) => {
                if stream.add_header(name, value).is_err() {
                    self.fatal_h1_status(400);
                    return false;
                }
                true
            }
            Err(err) => {
                warn!("bad header line: {err}");
                self.fatal_h1_status(400);
                false
            }
        }
    }

    fn finish_h1_headers(&mut self, events: &mut Vec<Event>) -> bool {
        let id = self.current_stream;
        let version = self.version;
        let secure = self.secure;

        // freeze headers and collect every decision in one borrow
        let decisions = {
            let Some(stream) = self.streams.get_mut(&id) else {
                self.fatal_h1_status(400);
                return false;
            };
            if stream.end_headers().is_err() {
                None
            } else {
                if stream.reject_status.is_none()
                    && version == HttpVersion::Http11
                    && !stream.headers().contains("host")
                    && !stream.headers().contains(":authority")
                {
                    stream.reject_status = Some(400);
                }
                let wants_h2c = stream.reject_status.is_none()
                    && version == HttpVersion::Http11
                    && !secure
                    && stream.wants_h2c();
                Some((
                    stream.chunked,
                    stream.content_length,
                    stream.method().map_or(false, |m| m.expects_body()),
                    wants_h2c,
                    if wants_h2c {
                        stream.h2c_settings.clone().unwrap_or_default()
                    } else {
                        Vec::new()
                    },
                ))
            }
        };
        let Some((chunked, content_length, expects_body, wants_h2c, h2c_params)) = decisions
        else {
            self.fatal_h1_status(400);
            return false;
        };
        let has_framed_body = chunked || content_length > 0;

        // cleartext upgrade preparation, RFC 7540 §3.2
        if wants_h2c {
            self.apply_settings_params(&h2c_params);
            if has_framed_body {
                // the 101 is deferred until the body is drained
                self.h2c_upgrade_pending = true;
            } else {
                return self.h2c_upgrade_now(events);
            }
        }

        // 411: a body is expected but neither framing is present
        if content_length < 0
            && expects_body
            && version != HttpVersion::Http10
            && self
                .streams
                .get(&id)
                .map_or(false, |stream| stream.reject_status.is_none())
        {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.reject_status = Some(411);
            }
        }

        if let Some(status) = self.streams.get(&id).and_then(|stream| stream.reject_status) {
            response::send_simple_status(self, id, status);
        }

        if chunked {
            self.emit_headers(events, id, false);
            self.state = State::BodyChunkedSize;
        } else if content_length > 0 {
            self.emit_headers(events, id, false);
            self.state = State::Body;
        } else if content_length < 0 && expects_body && version == HttpVersion::Http10 {
            self.emit_headers(events, id, false);
            self.state = State::BodyUntilClose;
        } else {
            // no body at all
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.end_stream_received = true;
            }
            self.emit_headers(events, id, true);
            self.emit_end(events, id);
            self.state = State::RequestLine;
        }
        true
    }

    fn emit_headers(&mut self, events: &mut Vec<Event>, id: StreamId, end_stream: bool) {
        if let Some(stream) = self.streams.get(&id) {
            if stream.reject_status.is_none() {
                events.push(Event::Headers {
                    stream: id,
                    headers: stream.headers().clone(),
                    end_stream,
                });
            }
        }
    }

    fn emit_end(&mut self, events: &mut Vec<Event>, id: StreamId) {
        if let Some(stream) = self.streams.get(&id) {
            if stream.reject_status.is_none() {
                events.push(Event::End { stream: id });
            }
        }
    }

    fn h2c_upgrade_now(&mut self, events: &mut Vec<Event>) -> bool {
        let id = self.current_stream;
        debug!("h2c upgrade on stream {id}");
        self.outbox.extend_from_slice(
            b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n",
        );
        self.enter_h2(CONNECTION_PREFACE, false);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.end_stream_received = true;
        }
        self.emit_headers(events, id, true);
        self.emit_end(events, id);
        true
    }

    fn on_body(&mut self, events: &mut Vec<Event>) -> bool {
        if self.read_buf.is_empty() {
            return false;
        }
        let id = self.current_stream;
        let Some(stream) = self.streams.get_mut(&id) else {
            self.fatal_h1_status(400);
            return false;
        };
        let needed = usize::try_from(stream.body_bytes_needed()).unwrap_or(0);
        let take = needed.min(self.read_buf.len());
        let data = self.read_buf.split_to(take).freeze();
        stream.consume_body(take);
        let remaining = stream.body_bytes_needed();
        let suppressed = stream.reject_status.is_some();
        if !suppressed && !data.is_empty() {
            events.push(Event::Body { stream: id, data });
        }
        if remaining == 0 {
            return self.finish_h1_request(events);
        }
        !self.read_buf.is_empty()
    }

    fn on_body_until_close(&mut self, events: &mut Vec<Event>) -> bool {
        if self.read_buf.is_empty() {
            return false;
        }
        let id = self.current_stream;
        let data = self.read_buf.split().freeze();
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.reject_status.is_none() {
                events.push(Event::Body { stream: id, data });
            }
        }
        false
    }

    fn on_chunk_size(&mut self) -> bool {
        let line = match next_line(&mut self.read_buf) {
            Err(LineOverflow) => {
                self.fatal_h1_status(400);
                return false;
            }
            Ok(None) => return false,
            Ok(Some(line)) => line,
        };
        let raw = strip_crlf(&line);
        // chunk-size [ ";" ext ]
        let size_part = raw.split(|&b| b == b';').next().unwrap_or(raw);
        let text = match std::str::from_utf8(size_part) {
            Ok(text) => text.trim(),
            Err(_) => {
                self.fatal_h1_status(400);
                return false;
            }
        };
        match usize::from_str_radix(text, 16) {
            Ok(0) => {
                self.trailer_headers.clear();
                self.state = State::BodyChunkedTrailer;
                true
            }
            Ok(size) => {
                self.chunk_remaining = size;
                self.state = State::BodyChunkedData;
                true
            }
            Err(_) => {
                warn!("bad chunk size line");
                self.fatal_h1_status(400);
                false
            }
        }
    }

    fn on_chunk_data(&mut self, events: &mut Vec<Event>) -> bool {
        if self.chunk_remaining > 0 {
            if self.read_buf.is_empty() {
                return false;
            }
            let id = self.current_stream;
            let take = self.chunk_remaining.min(self.read_buf.len());
            let data = self.read_buf.split_to(take).freeze();
            self.chunk_remaining -= take;
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.consume_body(take);
                if stream.reject_status.is_none() {
                    events.push(Event::Body { stream: id, data });
                }
            }
            if self.chunk_remaining > 0 {
                return false;
            }
        }
        // the chunk payload is followed by a bare CRLF
        if self.read_buf.len() < 2 {
            return false;
        }
        let crlf = self.read_buf.split_to(2);
        if &crlf[..] != b"\r\n" {
            self.fatal_h1_status(400);
            return false;
        }
        self.state = State::BodyChunkedSize;
        true
    }

    fn on_chunk_trailer(&mut self, events: &mut Vec<Event>) -> bool {
        let line = match next_line(&mut self.read_buf) {
            Err(LineOverflow) => {
                self.fatal_h1_status(431);
                return false;
            }
            Ok(None) => return false,
            Ok(Some(line)) => line,
        };
        let raw = strip_crlf(&line);
        if raw.is_empty() {
            let id = self.current_stream;
            let trailers = mem::take(&mut self.trailer_headers);
            if !trailers.is_empty() {
                if let Some(stream) = self.streams.get(&id) {
                    if stream.reject_status.is_none() {
                        events.push(Event::Trailers {
                            stream: id,
                            headers: trailers,
                        });
                    }
                }
            }
            return self.finish_h1_request(events);
        }
        if raw[0] == b' ' || raw[0] == b'\t' {
            let text = normalize_value(&latin1_to_string(raw));
            if self.trailer_headers.extend_last(&text).is_err() {
                self.fatal_h1_status(400);
                return false;
            }
            return true;
        }
        match parse_field_line(raw) {
            Ok((name, value)) => {
                self.trailer_headers.add(name, value);
                true
            }
            Err(_) => {
                self.fatal_h1_status(400);
                false
            }
        }
    }

    fn finish_h1_request(&mut self, events: &mut Vec<Event>) -> bool {
        let id = self.current_stream;
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.end_stream_received = true;
        }
        if self.h2c_upgrade_pending {
            self.h2c_upgrade_pending = false;
            debug!("h2c upgrade (deferred) on stream {id}");
            self.outbox.extend_from_slice(
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n",
            );
            self.enter_h2(CONNECTION_PREFACE, false);
        } else {
            self.state = State::RequestLine;
        }
        self.emit_end(events, id);
        true
    }

    // ---- preface and binary states --------------------------------------

    /// Commit to HTTP/2: allocate the HPACK context, send the server
    /// preface (an empty SETTINGS frame) and start expecting
    /// `expected` preface bytes (`optional` after ALPN).
    fn enter_h2(&mut self, expected: &'static [u8], optional: bool) {
        self.version = HttpVersion::Http2;
        if self.codec.is_none() {
            self.codec = Some(HeaderCodec::new(
                self.config.settings[SettingsParameter::HeaderTableSize],
            ));
        }
        if !self.server_preface_sent {
            Frame::Settings {
                ack: false,
                params: Vec::new(),
            }
            .encode_into(0, &mut self.outbox);
            self.server_preface_sent = true;
        }
        self.preface_expected = expected;
        self.preface_optional = optional;
        self.state = State::Pri;
    }

    fn on_pri(&mut self) -> bool {
        let expected = self.preface_expected;
        let have = self.read_buf.len().min(expected.len());
        let matches_so_far = self.read_buf[..have] == expected[..have];
        if self.preface_optional {
            // post-ALPN the preface is consumed if present, otherwise
            // frames begin immediately
            if !matches_so_far {
                self.state = State::PriSettings;
                return true;
            }
            if have < expected.len() {
                return false;
            }
            self.read_buf.advance(expected.len());
            self.state = State::PriSettings;
            return true;
        }
        if !matches_so_far {
            warn!("bad connection preface");
            self.fatal_h1_status(400);
            return false;
        }
        if have < expected.len() {
            return false;
        }
        self.read_buf.advance(expected.len());
        self.state = State::PriSettings;
        true
    }

    fn on_pri_settings(&mut self) -> bool {
        let max = self.config.settings[SettingsParameter::MaxFrameSize];
        match Frame::parse(&mut self.read_buf, max) {
            Ok(None) => false,
            Err(err) => {
                warn!("frame error in preface: {err}");
                self.connection_error(err.error_type())
            }
            Ok(Some(Frame::Settings { ack: false, params })) => {
                self.apply_settings_params(&params);
                Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                }
                .encode_into(0, &mut self.outbox);
                debug!("HTTP/2 established");
                self.state = State::Http2;
                true
            }
            Ok(Some(other)) => {
                warn!("first frame after preface was {other:?}");
                self.connection_error(ErrorType::ProtocolError)
            }
        }
    }

    fn on_http2(&mut self, events: &mut Vec<Event>) -> bool {
        let max = self.config.settings[SettingsParameter::MaxFrameSize];
        match Frame::parse(&mut self.read_buf, max) {
            Ok(None) => false,
            Err(err) => {
                warn!("frame error: {err}");
                self.connection_error(err.error_type())
            }
            Ok(Some(frame)) => self.handle_frame(frame, events),
        }
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> bool {
        match frame {
            Frame::Unknown { typ } => {
                trace!("ignoring unknown frame type {typ:#x}");
                true
            }
            Frame::Data {
                stream: id,
                end_stream,
                data,
            } => self.on_h2_data(id, end_stream, data, events),
            Frame::Headers {
                stream: id,
                end_stream,
                end_headers,
                fragment,
                ..
            } => self.on_h2_headers(id, end_stream, end_headers, &fragment, events),
            Frame::Priority { stream, .. } => {
                // accepted and discarded
                trace!("PRIORITY on stream {stream}");
                true
            }
            Frame::ResetStream { stream: id, error } => {
                // idempotent once the stream is already closed
                if let Some(stream) = self.streams.get_mut(&id) {
                    if !stream.closed {
                        if stream.push_promise {
                            debug!("peer declined promised stream {id}: {error:?}");
                        } else {
                            debug!("stream {id} reset by peer: {error:?}");
                        }
                        stream.close(Instant::now());
                        self.active_streams.remove(&id);
                        events.push(Event::Reset { stream: id, error });
                        self.maybe_finish_goaway();
                    }
                }
                true
            }
            Frame::Settings { ack: true, .. } => {
                trace!("SETTINGS ack");
                true
            }
            Frame::Settings { ack: false, params } => {
                self.apply_settings_params(&params);
                Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                }
                .encode_into(0, &mut self.outbox);
                response::flush_all_pending(self);
                true
            }
            Frame::PushPromise { stream, .. } => {
                // clients do not push
                warn!("PUSH_PROMISE from peer on stream {stream}");
                self.connection_error(ErrorType::ProtocolError)
            }
            Frame::Ping { ack: false, data } => {
                Frame::Ping { ack: true, data }.encode_into(0, &mut self.outbox);
                true
            }
            Frame::Ping { ack: true, .. } => {
                trace!("PING ack");
                true
            }
            Frame::GoAway {
                last_stream, error, ..
            } => {
                debug!("GOAWAY: {error:?}, last stream {last_stream}");
                self.goaway_received = true;
                events.push(Event::GoAway { last_stream, error });
                if self.active_streams.is_empty() {
                    self.close_after_flush = true;
                    self.state = State::Closed;
                    return false;
                }
                true
            }
            Frame::WindowUpdate {
                stream: 0,
                increment,
            } => {
                let updated = self.conn_send_window + i64::from(increment);
                if updated > i64::from(u32::MAX >> 1) {
                    return self.connection_error(ErrorType::FlowControlError);
                }
                self.conn_send_window = updated;
                response::flush_all_pending(self);
                true
            }
            Frame::WindowUpdate {
                stream: id,
                increment,
            } => {
                let Some(stream) = self.streams.get_mut(&id) else {
                    // window updates for evicted streams are noise
                    return true;
                };
                let updated = stream.send_window + i64::from(increment);
                if updated > i64::from(u32::MAX >> 1) {
                    return self.stream_error(id, ErrorType::FlowControlError, events);
                }
                stream.send_window = updated;
                response::flush_pending(self, id);
                true
            }
            Frame::Continuation { stream, .. } => {
                // only legal while a header block is open
                warn!("CONTINUATION outside a header block on stream {stream}");
                self.connection_error(ErrorType::ProtocolError)
            }
        }
    }

    fn on_h2_data(
        &mut self,
        id: StreamId,
        end_stream: bool,
        data: Bytes,
        events: &mut Vec<Event>,
    ) -> bool {
        match self.streams.get_mut(&id) {
            None if id > self.last_client_stream => {
                self.connection_error(ErrorType::ProtocolError)
            }
            None => self.stream_error(id, ErrorType::StreamClosed, events),
            Some(stream) if stream.closed || stream.end_stream_received => {
                self.stream_error(id, ErrorType::StreamClosed, events)
            }
            Some(stream) => {
                stream.consume_body(data.len());
                let suppressed = stream.reject_status.is_some();
                if end_stream {
                    stream.end_stream_received = true;
                }
                let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                if len > 0 {
                    // replenish receive windows right away
                    Frame::WindowUpdate {
                        stream: id,
                        increment: len,
                    }
                    .encode_into(0, &mut self.outbox);
                    Frame::WindowUpdate {
                        stream: 0,
                        increment: len,
                    }
                    .encode_into(0, &mut self.outbox);
                }
                if !suppressed {
                    if !data.is_empty() {
                        events.push(Event::Body { stream: id, data });
                    }
                    if end_stream {
                        events.push(Event::End { stream: id });
                    }
                }
                true
            }
        }
    }

    fn on_h2_headers(
        &mut self,
        id: StreamId,
        end_stream: bool,
        end_headers: bool,
        fragment: &[u8],
        events: &mut Vec<Event>,
    ) -> bool {
        // client streams carry odd ids only
        if id % 2 == 0 {
            return self.connection_error(ErrorType::ProtocolError);
        }
        match self.streams.get_mut(&id) {
            Some(stream) if stream.closed || stream.end_stream_received => {
                let ok = self.stream_error(id, ErrorType::StreamClosed, events);
                return ok && self.discard_header_block(id, end_headers, fragment);
            }
            Some(stream) => {
                // headers after dispatch are trailers; they must end
                // the stream
                if stream.headers_frozen() {
                    if !end_stream {
                        let ok = self.stream_error(id, ErrorType::ProtocolError, events);
                        return ok && self.discard_header_block(id, end_headers, fragment);
                    }
                    stream.receiving_trailers = true;
                }
            }
            None => {
                if id <= self.last_client_stream {
                    // stream ids never go backwards
                    return self.connection_error(ErrorType::ProtocolError);
                }
                self.last_client_stream = id;
                let refused = if self.goaway_sent || self.goaway_received {
                    trace!("refusing stream {id} after GOAWAY");
                    true
                } else {
                    let max = self.peer_settings[SettingsParameter::MaxConcurrentStreams];
                    if self.active_streams.len() as u64 >= u64::from(max) {
                        warn!("refusing stream {id}: concurrent stream limit {max}");
                        true
                    } else {
                        false
                    }
                };
                if refused {
                    Frame::ResetStream {
                        stream: id,
                        error: ErrorType::RefusedStream,
                    }
                    .encode_into(0, &mut self.outbox);
                    return self.discard_header_block(id, end_headers, fragment);
                }
                let now = Instant::now();
                self.maybe_sweep(now);
                let window = self.peer_settings[SettingsParameter::InitialWindowSize];
                self.streams.insert(id, Stream::new(id, window, now));
                self.active_streams.insert(id);
            }
        }

        if let Some(stream) = self.streams.get_mut(&id) {
            stream.fragment.extend_from_slice(fragment);
        }
        if end_headers {
            self.finish_header_block(id, end_stream, events)
        } else {
            self.continuation_stream = id;
            self.continuation_end_stream = end_stream;
            self.state = State::Http2Continuation;
            true
        }
    }

    fn on_http2_continuation(&mut self, events: &mut Vec<Event>) -> bool {
        let max = self.config.settings[SettingsParameter::MaxFrameSize];
        match Frame::parse(&mut self.read_buf, max) {
            Ok(None) => false,
            Err(err) => self.connection_error(err.error_type()),
            Ok(Some(Frame::Continuation {
                stream,
                end_headers,
                fragment,
            })) if stream == self.continuation_stream => {
                if self.continuation_discard {
                    self.discard_fragment.extend_from_slice(&fragment);
                } else if let Some(s) = self.streams.get_mut(&stream) {
                    s.fragment.extend_from_slice(&fragment);
                }
                if end_headers {
                    let end_stream = self.continuation_end_stream;
                    let discard = self.continuation_discard;
                    self.continuation_stream = 0;
                    self.continuation_end_stream = false;
                    self.continuation_discard = false;
                    self.state = State::Http2;
                    if discard {
                        self.drain_discarded_block()
                    } else {
                        self.finish_header_block(stream, end_stream, events)
                    }
                } else {
                    true
                }
            }
            Ok(Some(other)) => {
                // the only acceptable frame here is CONTINUATION on
                // the open header block's stream
                warn!(
                    "expected CONTINUATION on stream {}, got {other:?}",
                    self.continuation_stream
                );
                self.connection_error(ErrorType::ProtocolError)
            }
        }
    }

    /// A refused or closed stream's header block still has to pass
    /// through the decoder so the compression context stays in sync
    /// with the peer's encoder; only the result is dropped.
    fn discard_header_block(&mut self, id: StreamId, end_headers: bool, fragment: &[u8]) -> bool {
        self.discard_fragment.extend_from_slice(fragment);
        if end_headers {
            self.drain_discarded_block()
        } else {
            self.continuation_stream = id;
            self.continuation_end_stream = false;
            self.continuation_discard = true;
            self.state = State::Http2Continuation;
            true
        }
    }

    fn drain_discarded_block(&mut self) -> bool {
        let block = mem::take(&mut self.discard_fragment);
        if let Some(codec) = self.codec.as_mut() {
            if codec.decode(&block).is_err() {
                return self.connection_error(ErrorType::CompressionError);
            }
        }
        true
    }

    fn finish_header_block(
        &mut self,
        id: StreamId,
        end_stream: bool,
        events: &mut Vec<Event>,
    ) -> bool {
        let Some(stream) = self.streams.get_mut(&id) else {
            return true;
        };
        let block = mem::take(&mut stream.fragment);
        let receiving_trailers = stream.receiving_trailers;
        let Some(codec) = self.codec.as_mut() else {
            return self.connection_error(ErrorType::InternalError);
        };
        let decoded = match codec.decode(&block) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!("HPACK decode failed: {err}");
                return self.connection_error(ErrorType::CompressionError);
            }
        };

        let Some(stream) = self.streams.get_mut(&id) else {
            return true;
        };
        if receiving_trailers {
            stream.receiving_trailers = false;
            stream.end_stream_received = true;
            if stream.reject_status.is_none() {
                events.push(Event::Trailers {
                    stream: id,
                    headers: decoded,
                });
                events.push(Event::End { stream: id });
            }
            return true;
        }

        for (name, value) in decoded.iter() {
            if stream.add_header(name, value).is_err() {
                return self.stream_error(id, ErrorType::ProtocolError, events);
            }
        }
        if stream.end_headers().is_err() {
            return self.stream_error(id, ErrorType::ProtocolError, events);
        }
        if end_stream {
            stream.end_stream_received = true;
        }
        events.push(Event::Headers {
            stream: id,
            headers: stream.headers().clone(),
            end_stream,
        });
        if end_stream {
            events.push(Event::End { stream: id });
        }
        true
    }

    fn on_websocket(&mut self, events: &mut Vec<Event>) -> bool {
        if self.read_buf.is_empty() {
            return false;
        }
        let data = self.read_buf.split().freeze();
        events.push(Event::WebSocketData {
            stream: self.websocket_stream.unwrap_or(0),
            data,
        });
        false
    }

    // ---- shared plumbing -------------------------------------------------

    fn apply_settings_params(&mut self, params: &[(SettingsParameter, u32)]) {
        for &(param, value) in params {
            trace!("peer setting {param:?} = {value}");
            if param == SettingsParameter::InitialWindowSize {
                let delta = i64::from(value)
                    - i64::from(self.peer_settings[SettingsParameter::InitialWindowSize]);
                for stream in self.streams.values_mut() {
                    stream.send_window += delta;
                }
            }
            if param == SettingsParameter::HeaderTableSize {
                if let Some(codec) = self.codec.as_mut() {
                    codec.set_peer_table_size(value);
                }
            }
            self.peer_settings[param] = value;
        }
    }

    /// Stream-scope error: RST_STREAM and keep the connection going.
    pub(crate) fn stream_error(
        &mut self,
        id: StreamId,
        error: ErrorType,
        events: &mut Vec<Event>,
    ) -> bool {
        warn!("stream {id} error: {error:?}");
        Frame::ResetStream { stream: id, error }.encode_into(0, &mut self.outbox);
        if let Some(stream) = self.streams.get_mut(&id) {
            if !stream.closed {
                stream.close(Instant::now());
                self.active_streams.remove(&id);
                if stream.headers_frozen() {
                    events.push(Event::Reset { stream: id, error });
                }
            }
        }
        self.maybe_finish_goaway();
        true
    }

    /// Connection-scope error: GOAWAY then close.
    pub(crate) fn connection_error(&mut self, error: ErrorType) -> bool {
        error!("connection error: {error:?}");
        Frame::GoAway {
            last_stream: self.last_client_stream,
            error,
            debug: Bytes::new(),
        }
        .encode_into(0, &mut self.outbox);
        self.goaway_sent = true;
        self.close_after_flush = true;
        self.state = State::Closed;
        false
    }

    /// Minimal HTTP/1 status response followed by connection close,
    /// for failures where request framing can no longer be trusted.
    fn fatal_h1_status(&mut self, status: u16) {
        response::write_h1_simple(&mut self.outbox, status);
        self.close_after_flush = true;
        self.state = State::Closed;
    }

    /// A stream finished sending; release it and close out a draining
    /// connection if it was the last one.
    pub(crate) fn finish_stream_send(&mut self, id: StreamId) {
        let now = Instant::now();
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.close(now);
        }
        self.active_streams.remove(&id);
        if self.version != HttpVersion::Http2 {
            if let Some(stream) = self.streams.get(&id) {
                if stream.close_connection {
                    self.close_after_flush = true;
                    self.state = State::Closed;
                }
            }
        }
        self.maybe_finish_goaway();
    }

    /// Immediate close once queued output drains (HTTP/1 cancel path).
    pub(crate) fn close_now(&mut self) {
        self.close_after_flush = true;
        self.state = State::Closed;
    }

    fn maybe_finish_goaway(&mut self) {
        if (self.goaway_received || self.goaway_sent)
            && self.active_streams.is_empty()
            && self.state != State::Closed
            && self.version == HttpVersion::Http2
        {
            debug!("last stream drained after GOAWAY, closing");
            self.close_after_flush = true;
            self.state = State::Closed;
        }
    }

    /// Opportunistic eviction of closed streams past the retention
    /// window; runs at most once per retention period.
    fn maybe_sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_cleanup) < self.config.stream_retention {
            return;
        }
        self.last_cleanup = now;
        let retention = self.config.stream_retention;
        let before = self.streams.len();
        self.streams.retain(|_, stream| {
            !stream.closed
                || stream
                    .completed
                    .map_or(true, |t| now.duration_since(t) < retention)
        });
        if self.streams.len() != before {
            trace!("swept {} closed streams", before - self.streams.len());
        }
    }

    #[cfg(test)]
    pub(crate) fn sweep_now(&mut self, now: Instant) {
        self.last_cleanup = now - self.config.stream_retention;
        self.maybe_sweep(now);
    }
}
