use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::trace;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header line without a colon")]
    MissingColon,
    #[error("empty header name")]
    EmptyName,
    #[error("continuation line without a preceding header")]
    OrphanContinuation,
}

/// Ordered name/value list. Names match case-insensitively, duplicates
/// are allowed, and pseudo-headers (names starting with `:`) sort
/// before regular headers by construction: the state machine rejects a
/// pseudo-header once a regular one has been added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

pub fn is_pseudo(name: &str) -> bool {
    name.starts_with(':')
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Comma-separated values of every `name` field, trimmed. Used for
    /// `Connection` and `Upgrade` token lists.
    pub fn token_list(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Append `text` to the most recently added value, joined by a
    /// single space. Implements obs-fold continuation lines.
    pub fn extend_last(&mut self, text: &str) -> Result<(), HeaderError> {
        let (_, value) = self.entries.last_mut().ok_or(HeaderError::OrphanContinuation)?;
        if !value.is_empty() && !text.is_empty() {
            value.push(' ');
        }
        value.push_str(text);
        Ok(())
    }

    pub fn has_pseudo(&self) -> bool {
        self.entries.iter().any(|(k, _)| is_pseudo(k))
    }

    pub fn has_regular(&self) -> bool {
        self.entries.iter().any(|(k, _)| !is_pseudo(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }
}

impl<N: Into<String>, V: Into<String>> Extend<(N, V)> for Headers {
    fn extend<T: IntoIterator<Item = (N, V)>>(&mut self, iter: T) {
        self.entries
            .extend(iter.into_iter().map(|(n, v)| (n.into(), v.into())));
    }
}

/// Parse one non-folded header line (CRLF already stripped). The wire
/// is ISO-8859-1; the value gets encoded-word expansion and linear
/// whitespace normalization.
pub fn parse_field_line(line: &[u8]) -> Result<(String, String), HeaderError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(HeaderError::MissingColon)?;
    if colon == 0 {
        return Err(HeaderError::EmptyName);
    }
    let name = latin1_to_string(&line[..colon]);
    if name.trim().is_empty() {
        return Err(HeaderError::EmptyName);
    }
    let value = normalize_value(&latin1_to_string(&line[colon + 1..]));
    Ok((name, value))
}

/// Collapse runs of SP/HT into a single space and trim the ends, then
/// expand RFC 2047 encoded-words.
pub fn normalize_value(raw: &str) -> String {
    let mut collapsed = String::with_capacity(raw.len());
    let mut in_ws = true; // leading whitespace is dropped
    for c in raw.chars() {
        if c == ' ' || c == '\t' {
            if !in_ws {
                collapsed.push(' ');
                in_ws = true;
            }
        } else {
            collapsed.push(c);
            in_ws = false;
        }
    }
    while collapsed.ends_with(' ') {
        collapsed.pop();
    }
    decode_encoded_words(&collapsed)
}

pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Expand RFC 2047 `=?charset?B|Q?text?=` words. Whitespace between
/// two adjacent encoded words is dropped, per the RFC. Words that fail
/// to decode pass through verbatim.
pub fn decode_encoded_words(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_owned();
    }
    let mut out = String::with_capacity(value.len());
    let mut pending_ws = String::new();
    let mut last_was_word = false;
    for token in value.split(' ') {
        match decode_one_word(token) {
            Some(decoded) => {
                if !last_was_word {
                    out.push_str(&pending_ws);
                }
                out.push_str(&decoded);
                last_was_word = true;
            }
            None => {
                out.push_str(&pending_ws);
                out.push_str(token);
                last_was_word = false;
            }
        }
        pending_ws = " ".to_owned();
    }
    out
}

fn decode_one_word(token: &str) -> Option<String> {
    let inner = token.strip_prefix("=?")?.strip_suffix("?=")?;
    let mut parts = inner.splitn(3, '?');
    let charset = parts.next()?.to_ascii_lowercase();
    let encoding = parts.next()?;
    let text = parts.next()?;

    let bytes = match encoding {
        "B" | "b" => STANDARD.decode(text).ok()?,
        "Q" | "q" => decode_q(text)?,
        _ => return None,
    };
    match charset.as_str() {
        "utf-8" | "utf8" => Some(String::from_utf8_lossy(&bytes).into_owned()),
        "iso-8859-1" | "latin1" | "us-ascii" => Some(latin1_to_string(&bytes)),
        _ => {
            trace!("unhandled encoded-word charset {charset}");
            None
        }
    }
}

fn decode_q(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'_' => out.push(b' '),
            b'=' => {
                let hi = hex_digit(bytes.next()?)?;
                let lo = hex_digit(bytes.next()?)?;
                out.push(hi << 4 | lo);
            }
            _ => out.push(b),
        }
    }
    Some(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Re-encode a value for the HTTP/1 wire. ASCII passes through; other
/// values become a single UTF-8 encoded-word, B or Q chosen by
/// comparing the ASCII and non-ASCII counts.
pub fn encode_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_owned();
    }
    let ascii = value.bytes().filter(u8::is_ascii).count();
    let non_ascii = value.len() - ascii;
    if ascii >= non_ascii {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    } else {
        let mut out = String::from("=?UTF-8?Q?");
        for b in value.bytes() {
            match b {
                b' ' => out.push('_'),
                b'=' | b'?' | b'_' => out.push_str(&format!("={b:02X}")),
                _ if b.is_ascii_graphic() => out.push(char::from(b)),
                _ => out.push_str(&format!("={b:02X}")),
            }
        }
        out.push_str("?=");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_lookup_case_insensitive() {
        let mut headers = Headers::new();
        let (name, value) = parse_field_line(b"Content-Length:  42 ").unwrap();
        headers.add(name, value);
        assert_eq!(headers.get("content-length"), Some("42"));
        assert!(headers.contains("CONTENT-LENGTH"));
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut headers = Headers::new();
        headers.add("Set-Cookie", "a=1");
        headers.add("Set-Cookie", "b=2");
        assert_eq!(headers.get_all("set-cookie").collect::<Vec<_>>(), ["a=1", "b=2"]);
    }

    #[test]
    fn empty_name_rejected() {
        assert_eq!(parse_field_line(b": oops"), Err(HeaderError::EmptyName));
        assert_eq!(parse_field_line(b"no colon here"), Err(HeaderError::MissingColon));
    }

    #[test]
    fn folded_continuation_joins_with_space() {
        let mut headers = Headers::new();
        headers.add("X-Long", "first");
        headers.extend_last("second").unwrap();
        assert_eq!(headers.get("x-long"), Some("first second"));
    }

    #[test]
    fn token_list_splits_and_trims() {
        let mut headers = Headers::new();
        headers.add("Connection", "Upgrade, HTTP2-Settings");
        assert_eq!(
            headers.token_list("connection"),
            ["Upgrade", "HTTP2-Settings"]
        );
    }

    #[test]
    fn whitespace_runs_collapse() {
        assert_eq!(normalize_value("  a \t\t b  "), "a b");
    }

    #[test]
    fn decodes_b_and_q_words() {
        // https://datatracker.ietf.org/doc/html/rfc2047#section-8
        assert_eq!(
            decode_encoded_words("=?ISO-8859-1?Q?Andr=E9?= Pirard"),
            "Andr\u{e9} Pirard"
        );
        assert_eq!(decode_encoded_words("=?UTF-8?B?aGVsbG8=?="), "hello");
        // whitespace between adjacent words disappears
        assert_eq!(
            decode_encoded_words("=?UTF-8?B?YWI=?= =?UTF-8?B?Y2Q=?="),
            "abcd"
        );
    }

    #[test]
    fn malformed_words_pass_through() {
        assert_eq!(decode_encoded_words("=?bogus"), "=?bogus");
        assert_eq!(decode_encoded_words("=?UTF-8?X?zzz?="), "=?UTF-8?X?zzz?=");
    }

    #[test]
    fn encode_ascii_untouched() {
        assert_eq!(encode_value("plain value"), "plain value");
    }

    #[test]
    fn encode_mostly_ascii_uses_b() {
        let encoded = encode_value("caf\u{e9}");
        assert!(encoded.starts_with("=?UTF-8?B?"), "{encoded}");
        assert_eq!(decode_encoded_words(&encoded), "caf\u{e9}");
    }

    #[test]
    fn encode_mostly_non_ascii_uses_q() {
        let value = "\u{3053}\u{3093}\u{306b}\u{3061}\u{306f}";
        let encoded = encode_value(value);
        assert!(encoded.starts_with("=?UTF-8?Q?"), "{encoded}");
        assert_eq!(decode_encoded_words(&encoded), value);
    }
}
