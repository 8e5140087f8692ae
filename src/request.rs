use crate::{line::strip_crlf, types::HttpVersion};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "TRACE")]
    Trace,
    #[display(fmt = "CONNECT")]
    Connect,
    /// Any other valid token; dispatches as 501 Not Implemented.
    #[display(fmt = "{}", _0)]
    Other(String),
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Whether a request with neither Content-Length nor chunked
    /// framing is treated as having a body at all. GET/HEAD-like
    /// methods dispatch immediately; the rest need explicit framing
    /// (411 under HTTP/1.1, read-until-close under HTTP/1.0).
    pub fn expects_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: HttpVersion,
}

/// A request line is either an ordinary request or the opening line of
/// the HTTP/2 connection preface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRequestLine {
    Request(RequestLine),
    /// `PRI * HTTP/2.0`; the rest of the preface follows raw.
    PrefaceStart,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLineError {
    /// Maps to 400.
    #[error("malformed request line")]
    Malformed,
    /// Maps to 400.
    #[error("invalid request target")]
    BadTarget,
    /// Maps to 505.
    #[error("unsupported protocol version")]
    BadVersion,
}

/// Parse `METHOD SP TARGET SP VERSION CRLF`.
/// https://httpwg.org/specs/rfc7230.html#request.line
pub fn parse_request_line(line: &[u8]) -> Result<ParsedRequestLine, RequestLineError> {
    let text = std::str::from_utf8(strip_crlf(line)).map_err(|_| RequestLineError::Malformed)?;
    let mut parts = text.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(RequestLineError::Malformed),
    };
    if !method.bytes().all(is_tchar) {
        return Err(RequestLineError::Malformed);
    }

    if method == "PRI" && target == "*" && version == "HTTP/2.0" {
        return Ok(ParsedRequestLine::PrefaceStart);
    }

    let version = match version {
        "HTTP/1.1" => HttpVersion::Http11,
        "HTTP/1.0" => HttpVersion::Http10,
        v if v.starts_with("HTTP/") => return Err(RequestLineError::BadVersion),
        _ => return Err(RequestLineError::Malformed),
    };

    validate_target(target)?;

    Ok(ParsedRequestLine::Request(RequestLine {
        method: Method::from_token(method),
        target: target.to_owned(),
        version,
    }))
}

/// RFC 3986 unreserved and sub-delims, plus the extra request-target
/// characters `:@/?#[]`, plus pct-encoded triplets.
fn validate_target(target: &str) -> Result<(), RequestLineError> {
    let bytes = target.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 >= bytes.len()
                    || !bytes[i + 1].is_ascii_hexdigit()
                    || !bytes[i + 2].is_ascii_hexdigit()
                {
                    return Err(RequestLineError::BadTarget);
                }
                i += 3;
            }
            b if is_target_char(b) => i += 1,
            _ => return Err(RequestLineError::BadTarget),
        }
    }
    // absolute-form targets additionally have to parse as a URL
    if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target).map_err(|_| RequestLineError::BadTarget)?;
    }
    Ok(())
}

fn is_target_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'-' | b'.'
                | b'_'
                | b'~'
                | b'!'
                | b'$'
                | b'&'
                | b'\''
                | b'('
                | b')'
                | b'*'
                | b'+'
                | b','
                | b';'
                | b'='
                | b':'
                | b'@'
                | b'/'
                | b'?'
                | b'#'
                | b'['
                | b']'
        )
}

/// https://httpwg.org/specs/rfc7230.html#rule.token.separators
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
