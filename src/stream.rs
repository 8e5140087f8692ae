use crate::{
    headers::{is_pseudo, Headers},
    request::Method,
    types::{SettingsParameter, StreamId},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::BytesMut;
use log::{trace, warn};
use num_traits::FromPrimitive;
use std::time::Instant;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// Pseudo-headers must precede all regular headers.
    #[error("pseudo-header after regular header")]
    PseudoAfterRegular,
    #[error("header received after end of headers")]
    HeadersFrozen,
    #[error("invalid content-length")]
    BadContentLength,
    #[error("content-length conflicts with chunked transfer coding")]
    LengthWithChunked,
}

/// Per-request state. For HTTP/1 the connection synthesizes odd stream
/// ids so both versions share one shape; the request line becomes the
/// `:method`/`:path`/`:scheme`/`:authority` pseudo-headers.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub closed: bool,
    /// HTTP/1.0, or `Connection: close` on the request.
    pub close_connection: bool,
    pub created: Instant,
    pub completed: Option<Instant>,

    headers: Headers,
    headers_frozen: bool,
    /// Parsed Content-Length; -1 when unknown.
    pub content_length: i64,
    pub chunked: bool,
    pub upgrade: Vec<String>,
    pub h2c_settings: Option<Vec<(SettingsParameter, u32)>>,
    /// Header-block fragments accumulated across HEADERS and
    /// CONTINUATION frames, fed to HPACK once END_HEADERS arrives.
    pub fragment: BytesMut,
    pub end_stream_received: bool,
    pub push_promise: bool,
    /// Status to answer with instead of dispatching to the handler
    /// (501 unknown method, 400 missing Host, 411 missing framing).
    /// The body is still drained to keep the connection usable.
    pub reject_status: Option<u16>,
    /// The current header block is a trailer section.
    pub receiving_trailers: bool,
    body_remaining: i64,

    // response emission state, driven through ResponseHandle
    pub response_status: u16,
    pub response_headers: Headers,
    /// Headers buffered after `end_body`; emitted as trailers.
    pub response_trailers: Headers,
    pub response_started: bool,
    /// `end_body` was called; later headers are trailers.
    pub response_body_ended: bool,
    pub end_stream_sent: bool,
    /// HTTP/2 send window for this stream; body bytes beyond it queue
    /// in `pending_body` until WINDOW_UPDATE.
    pub send_window: i64,
    pub pending_body: BytesMut,
    pub pending_end: bool,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId, send_window: u32, now: Instant) -> Self {
        trace!("stream {id} created");
        Self {
            id,
            closed: false,
            close_connection: false,
            created: now,
            completed: None,
            headers: Headers::new(),
            headers_frozen: false,
            content_length: -1,
            chunked: false,
            upgrade: Vec::new(),
            h2c_settings: None,
            fragment: BytesMut::new(),
            end_stream_received: false,
            push_promise: false,
            reject_status: None,
            receiving_trailers: false,
            body_remaining: -1,
            response_status: 0,
            response_headers: Headers::new(),
            response_trailers: Headers::new(),
            response_started: false,
            response_body_ended: false,
            end_stream_sent: false,
            send_window: i64::from(send_window),
            pending_body: BytesMut::new(),
            pending_end: false,
        }
    }

    /// Accepted until `end_headers`; pseudo-headers must precede all
    /// regular ones.
    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), StreamError> {
        if self.headers_frozen {
            return Err(StreamError::HeadersFrozen);
        }
        let name = name.into();
        if is_pseudo(&name) && self.headers.has_regular() {
            return Err(StreamError::PseudoAfterRegular);
        }
        self.headers.add(name, value.into());
        Ok(())
    }

    /// Continuation line support for folded HTTP/1 headers.
    pub fn extend_last_header(&mut self, text: &str) -> Result<(), StreamError> {
        if self.headers_frozen {
            return Err(StreamError::HeadersFrozen);
        }
        self.headers
            .extend_last(text)
            .map_err(|_| StreamError::HeadersFrozen)
    }

    /// Freeze the header section and derive body framing: parsed
    /// Content-Length, chunked flag, Upgrade tokens, decoded
    /// `HTTP2-Settings`. The caller dispatches to the handler next.
    pub fn end_headers(&mut self) -> Result<(), StreamError> {
        self.headers_frozen = true;

        for value in self.headers.get_all("content-length") {
            let parsed: i64 = value
                .trim()
                .parse()
                .map_err(|_| StreamError::BadContentLength)?;
            if parsed < 0 || (self.content_length >= 0 && parsed != self.content_length) {
                return Err(StreamError::BadContentLength);
            }
            self.content_length = parsed;
        }

        self.chunked = self
            .headers
            .token_list("transfer-encoding")
            .iter()
            .any(|t| t.eq_ignore_ascii_case("chunked"));
        if self.chunked && self.content_length >= 0 {
            return Err(StreamError::LengthWithChunked);
        }

        self.upgrade = self.headers.token_list("upgrade");
        if let Some(value) = self.headers.get("http2-settings") {
            self.h2c_settings = decode_h2c_settings(value);
        }

        if self
            .headers
            .token_list("connection")
            .iter()
            .any(|t| t.eq_ignore_ascii_case("close"))
        {
            self.close_connection = true;
        }

        self.body_remaining = self.content_length;
        Ok(())
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_frozen(&self) -> bool {
        self.headers_frozen
    }

    pub fn method(&self) -> Option<Method> {
        self.headers.get(":method").map(Method::from_token)
    }

    /// Upgrade to cleartext HTTP/2 requested and usable.
    pub fn wants_h2c(&self) -> bool {
        self.upgrade.iter().any(|t| t.eq_ignore_ascii_case("h2c")) && self.h2c_settings.is_some()
    }

    /// Remaining request-body bytes under Content-Length framing; -1
    /// when the length is unknown.
    pub fn body_bytes_needed(&self) -> i64 {
        self.body_remaining
    }

    pub fn consume_body(&mut self, n: usize) {
        if self.body_remaining > 0 {
            self.body_remaining -= i64::try_from(n).unwrap_or(i64::MAX);
        }
    }

    pub fn close(&mut self, now: Instant) {
        if !self.closed {
            trace!(
                "stream {} closed after {:?}",
                self.id,
                now.saturating_duration_since(self.created)
            );
            self.closed = true;
            self.completed = Some(now);
        }
    }
}

/// `HTTP2-Settings` carries a base64url (no padding) SETTINGS payload.
/// https://httpwg.org/specs/rfc7540.html#Http2SettingsHeader
fn decode_h2c_settings(value: &str) -> Option<Vec<(SettingsParameter, u32)>> {
    let bytes = match URL_SAFE_NO_PAD.decode(value) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("ignoring undecodable HTTP2-Settings: {err}");
            return None;
        }
    };
    if bytes.len() % 6 != 0 {
        warn!("ignoring HTTP2-Settings with trailing bytes");
        return None;
    }
    let mut params = Vec::with_capacity(bytes.len() / 6);
    for chunk in bytes.chunks(6) {
        // unwrap: chunk slices are exactly 2 and 4 bytes
        let id = u16::from_be_bytes(chunk[0..2].try_into().unwrap());
        let value = u32::from_be_bytes(chunk[2..6].try_into().unwrap());
        if let Some(param) = SettingsParameter::from_u16(id) {
            params.push((param, value));
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(1, 65_535, Instant::now())
    }

    #[test]
    fn pseudo_headers_must_come_first() {
        let mut s = stream();
        s.add_header(":method", "GET").unwrap();
        s.add_header("host", "a").unwrap();
        assert_eq!(
            s.add_header(":path", "/"),
            Err(StreamError::PseudoAfterRegular)
        );
    }

    #[test]
    fn headers_freeze_after_end() {
        let mut s = stream();
        s.add_header("host", "a").unwrap();
        s.end_headers().unwrap();
        assert_eq!(s.add_header("late", "x"), Err(StreamError::HeadersFrozen));
    }

    #[test]
    fn content_length_parsed() {
        let mut s = stream();
        s.add_header("Content-Length", "42").unwrap();
        s.end_headers().unwrap();
        assert_eq!(s.content_length, 42);
        assert_eq!(s.body_bytes_needed(), 42);
        s.consume_body(40);
        assert_eq!(s.body_bytes_needed(), 2);
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let mut s = stream();
        s.add_header("Content-Length", "1").unwrap();
        s.add_header("Content-Length", "2").unwrap();
        assert_eq!(s.end_headers(), Err(StreamError::BadContentLength));
    }

    #[test]
    fn chunked_excludes_content_length() {
        let mut s = stream();
        s.add_header("Content-Length", "5").unwrap();
        s.add_header("Transfer-Encoding", "chunked").unwrap();
        assert_eq!(s.end_headers(), Err(StreamError::LengthWithChunked));
    }

    #[test]
    fn h2c_settings_decoded() {
        let mut s = stream();
        s.add_header("Upgrade", "h2c").unwrap();
        s.add_header("HTTP2-Settings", "AAMAAABkAAQAoAAAAAIAAAAA")
            .unwrap();
        s.end_headers().unwrap();
        assert!(s.wants_h2c());
        assert_eq!(
            s.h2c_settings.as_deref(),
            Some(
                &[
                    (SettingsParameter::MaxConcurrentStreams, 100),
                    (SettingsParameter::InitialWindowSize, 0x00a0_0000),
                    (SettingsParameter::EnablePush, 0),
                ][..]
            )
        );
    }

    #[test]
    fn connection_close_sets_flag() {
        let mut s = stream();
        s.add_header("Connection", "close").unwrap();
        s.end_headers().unwrap();
        assert!(s.close_connection);
    }

    #[test]
    fn close_is_monotonic() {
        let mut s = stream();
        let t0 = Instant::now();
        s.close(t0);
        let first = s.completed;
        s.close(Instant::now());
        assert_eq!(s.completed, first);
        assert!(s.closed);
    }
}
