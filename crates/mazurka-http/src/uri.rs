//! URI parsing, composition and resolution.
//!
//! The parser is intentionally permissive about what it accepts from
//! the wire (a request target is rarely a full absolute URI) and strict
//! about what it produces: `format` always renders a URI that parses
//! back to the same structural fields.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::error::{HttpError, HttpResult};

/// Characters escaped when rendering a path segment.
const PATH_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`').add(b'#').add(b'?');

/// A parsed URI. Fields are stored decoded except `query`, which keeps
/// its raw form so `a=b&c=d` splitting stays unambiguous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    /// Fragment reference (the part after `#`).
    pub reference: Option<String>,
    /// Filename extension of the last path segment, lowercased.
    pub ext: Option<String>,
}

impl Uri {
    /// Parse an absolute URI or a request target (origin-form).
    pub fn parse(text: &str) -> HttpResult<Uri> {
        if text.is_empty() {
            return Err(HttpError::Parse("empty uri".into()));
        }
        let mut uri = Uri::default();
        let mut rest = text;

        if let Some(idx) = rest.find("://") {
            let scheme = &rest[..idx];
            if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') {
                return Err(HttpError::Parse(format!("bad scheme in {text}")));
            }
            uri.scheme = Some(scheme.to_ascii_lowercase());
            rest = &rest[idx + 3..];

            let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
            let authority = &rest[..authority_end];
            rest = &rest[authority_end..];
            uri.set_authority(authority)?;
        }

        let (path_part, tail) = match rest.find(['?', '#']) {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        uri.path = decode(path_part)?;
        if uri.path.is_empty() {
            uri.path = "/".into();
        }

        let mut tail = tail;
        if let Some(stripped) = tail.strip_prefix('?') {
            let end = stripped.find('#').unwrap_or(stripped.len());
            uri.query = Some(stripped[..end].to_string());
            tail = &stripped[end..];
        }
        if let Some(stripped) = tail.strip_prefix('#') {
            uri.reference = Some(decode(stripped)?);
        }

        uri.ext = extension(&uri.path);
        Ok(uri)
    }

    fn set_authority(&mut self, authority: &str) -> HttpResult<()> {
        if authority.is_empty() {
            return Ok(());
        }
        // IPv6 literals keep their brackets around the colon-rich host.
        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            match rest.find(']') {
                Some(end) => {
                    let port = rest[end + 1..].strip_prefix(':');
                    (&rest[..end], port)
                }
                None => return Err(HttpError::Parse(format!("unterminated ipv6 host in {authority}"))),
            }
        } else {
            match authority.rfind(':') {
                Some(idx) => (&authority[..idx], Some(&authority[idx + 1..])),
                None => (authority, None),
            }
        };
        if !host.is_empty() {
            self.host = Some(host.to_ascii_lowercase());
        }
        if let Some(port) = port {
            self.port = Some(
                port.parse::<u16>()
                    .map_err(|_| HttpError::Parse(format!("bad port in {authority}")))?,
            );
        }
        Ok(())
    }

    /// Render the URI. The inverse of `parse` up to escaping.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(ref scheme) = self.scheme {
            out.push_str(scheme);
            out.push_str("://");
            if let Some(ref host) = self.host {
                if host.contains(':') {
                    out.push('[');
                    out.push_str(host);
                    out.push(']');
                } else {
                    out.push_str(host);
                }
            }
            if let Some(port) = self.port
                && !self.is_default_port(port)
            {
                out.push_str(&format!(":{port}"));
            }
        }
        out.push_str(&utf8_percent_encode(&self.path, PATH_SET).to_string());
        if let Some(ref query) = self.query {
            out.push('?');
            out.push_str(query);
        }
        if let Some(ref reference) = self.reference {
            out.push('#');
            out.push_str(&utf8_percent_encode(reference, PATH_SET).to_string());
        }
        out
    }

    fn is_default_port(&self, port: u16) -> bool {
        match self.scheme.as_deref() {
            Some("http") | Some("ws") => port == 80,
            Some("https") | Some("wss") => port == 443,
            _ => false,
        }
    }

    /// The port to connect to, falling back to the scheme default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.scheme.as_deref() {
            Some("https") | Some("wss") => 443,
            _ => 80,
        })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_deref(), Some("https") | Some("wss"))
    }

    /// Collapse `.` and `..` segments and duplicate slashes. A path that
    /// escapes the root is truncated at the root, which keeps routed
    /// paths inside the document tree.
    pub fn normalize(&mut self) {
        self.path = normalize_path(&self.path);
        self.ext = extension(&self.path);
    }

    /// Resolve `other` against `self` per the usual base-URI rules:
    /// missing scheme/host inherit from the base, absolute paths
    /// replace, relative paths join onto the base directory.
    pub fn resolve(&self, other: &Uri) -> Uri {
        let mut out = other.clone();
        if out.scheme.is_none() {
            out.scheme = self.scheme.clone();
        }
        if out.host.is_none() {
            out.host = self.host.clone();
            if out.port.is_none() {
                out.port = self.port;
            }
        }
        if !out.path.starts_with('/') {
            let dir = match self.path.rfind('/') {
                Some(idx) => &self.path[..=idx],
                None => "/",
            };
            out.path = format!("{dir}{}", out.path);
        }
        out.path = normalize_path(&out.path);
        out.ext = extension(&out.path);
        out
    }

    /// Decoded query pairs in declared order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query.as_deref().map(parse_query).unwrap_or_default()
    }

    /// The first value of a query parameter, decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Append a query parameter, encoding both sides.
    pub fn add_query_param(&mut self, name: &str, value: &str) {
        let pair = format!(
            "{}={}",
            encode_component(name),
            encode_component(value)
        );
        match self.query {
            Some(ref mut query) if !query.is_empty() => {
                query.push('&');
                query.push_str(&pair);
            }
            _ => self.query = Some(pair),
        }
    }

    /// Expand a `${token}` template against a lookup callback. Unknown
    /// tokens expand to nothing. `$$` renders a literal dollar.
    pub fn expand_template<F>(template: &str, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some(&(_, '$')) => {
                    chars.next();
                    out.push('$');
                }
                Some(&(start, '{')) => {
                    if let Some(end) = template[start..].find('}') {
                        let token = &template[start + 1..start + end];
                        if let Some(value) = lookup(token) {
                            out.push_str(&value);
                        }
                        while let Some(&(i, _)) = chars.peek() {
                            if i > start + end {
                                break;
                            }
                            chars.next();
                        }
                    } else {
                        out.push('$');
                    }
                }
                Some(&(start, d)) if d.is_ascii_digit() => {
                    let tail = &template[start..];
                    let len = tail.chars().take_while(|c| c.is_ascii_digit()).count();
                    let token = &tail[..len];
                    if let Some(value) = lookup(token) {
                        out.push_str(&value);
                    }
                    for _ in 0..len {
                        chars.next();
                    }
                }
                _ => out.push('$'),
            }
        }
        out
    }
}

/// Percent-decode, rejecting embedded NUL which has no business in a path.
fn decode(text: &str) -> HttpResult<String> {
    let decoded = percent_decode_str(text)
        .decode_utf8()
        .map_err(|_| HttpError::Parse(format!("invalid utf-8 in {text}")))?;
    if decoded.contains('\0') {
        return Err(HttpError::Parse("NUL in uri".into()));
    }
    Ok(decoded.into_owned())
}

fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let dot = segment.rfind('.')?;
    if dot == 0 || dot + 1 == segment.len() {
        return None;
    }
    Some(segment[dot + 1..].to_ascii_lowercase())
}

/// Segment-wise path normalization. Keeps a trailing slash, since the
/// router distinguishes directory requests by it.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let trailing = path.len() > 1 && path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut out = if absolute { String::from("/") } else { String::new() };
    out.push_str(&segments.join("/"));
    if trailing && !out.ends_with('/') {
        out.push('/');
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Split a raw query string into decoded key/value pairs.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = match part.split_once('=') {
                Some((k, v)) => (k, v),
                None => (part, ""),
            };
            (
                decode_form_component(k),
                decode_form_component(v),
            )
        })
        .collect()
}

/// Escape a query component: everything outside the unreserved set.
pub fn encode_component(text: &str) -> String {
    const COMPONENT_SET: &AsciiSet = &CONTROLS
        .add(b' ')
        .add(b'"')
        .add(b'#')
        .add(b'&')
        .add(b'%')
        .add(b'+')
        .add(b'=')
        .add(b'?')
        .add(b'/');
    utf8_percent_encode(text, COMPONENT_SET).to_string()
}

/// Form decoding treats `+` as space before percent-decoding.
pub fn decode_form_component(text: &str) -> String {
    let plus_fixed = text.replace('+', " ");
    percent_decode_str(&plus_fixed)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or(plus_fixed)
}
