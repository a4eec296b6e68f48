// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message model and wire codec.
//!
//! A [`SipMessage`] is either a request or a response, made disjoint by the
//! [`StartLine`] enum, with an ordered header list and an opaque body.
//! Parsing is tolerant of compact header names; serialization appends a
//! `Content-Length` header when the caller did not set one.

use bytes::{Bytes, BytesMut};
use smol_str::SmolStr;

use crate::headers::{expand_compact_name, Headers};
use crate::method::Method;

/// The first line of a SIP message, determining request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: SmolStr },
    Response { code: u16, reason: SmolStr },
}

/// A SIP request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipMessage {
    /// Creates a request with an empty header list and body.
    pub fn request(method: Method, uri: impl Into<SmolStr>) -> Self {
        SipMessage {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a response with an empty header list and body.
    pub fn response(code: u16, reason: impl Into<SmolStr>) -> Self {
        SipMessage {
            start: StartLine::Response {
                code,
                reason: reason.into(),
            },
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Parses a SIP message from raw network bytes.
    ///
    /// Returns `None` when the start line is neither a valid request line
    /// nor a valid status line, or when a header line is malformed. The body
    /// is everything after the blank line; `Content-Length` is not enforced
    /// on ingress (UDP datagrams are self-delimiting).
    pub fn parse(datagram: &[u8]) -> Option<SipMessage> {
        let (head, body) = split_head_body(datagram)?;
        let mut lines = head.split("\r\n");
        let first = lines.next()?.trim();
        if first.is_empty() {
            return None;
        }

        let start = parse_status_line(first)
            .or_else(|| parse_request_line(first))?;

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon = line.find(':')?;
            let name = expand_compact_name(line[..colon].trim());
            let value = line[colon + 1..].trim();
            headers.push(SmolStr::new(name), SmolStr::new(value));
        }

        Some(SipMessage {
            start,
            headers,
            body: Bytes::copy_from_slice(body),
        })
    }

    /// Returns `true` when the message is a request.
    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// Returns `true` when the message is a response.
    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    /// Returns the request method, or `None` for responses.
    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// Returns the request URI, or `None` for responses.
    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri.as_str()),
            StartLine::Response { .. } => None,
        }
    }

    /// Returns the status code, or `None` for requests.
    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    /// Returns the reason phrase, or `None` for requests.
    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason.as_str()),
            StartLine::Request { .. } => None,
        }
    }

    /// Returns every occurrence of this header joined with `", "`, or `None`
    /// when the header is absent.
    pub fn header(&self, name: &str) -> Option<SmolStr> {
        let mut out = String::new();
        let mut found = false;
        for value in self.headers.get_all(name) {
            if found {
                out.push_str(", ");
            }
            out.push_str(value);
            found = true;
        }
        found.then(|| SmolStr::new(out))
    }

    /// Returns the individual values of this header, splitting each
    /// occurrence on commas and trimming whitespace.
    ///
    /// The split is unconditional: a comma inside a quoted string or a
    /// display name also separates values. Call sites that compare values
    /// (registration expiry discovery) rely on this segmentation, so it is
    /// kept as-is.
    pub fn header_values(&self, name: &str) -> Vec<SmolStr> {
        self.headers
            .get_all(name)
            .flat_map(|v| v.split(','))
            .map(|v| SmolStr::new(v.trim()))
            .collect()
    }

    /// Appends a header, keeping any existing occurrences.
    pub fn add_header(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.headers.push(name, value);
    }

    /// Replaces every occurrence of this header with a single value.
    pub fn set_header(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.headers.set(name, value);
    }

    /// Removes every occurrence of this header.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// Returns the numeric part of the `CSeq` header, if present.
    pub fn cseq_number(&self) -> Option<u32> {
        self.headers
            .get("CSeq")
            .and_then(|v| v.split_whitespace().next().and_then(|n| n.parse().ok()))
    }

    /// Serializes the message, appending `Content-Length` when absent.
    pub fn to_bytes(&self) -> Bytes {
        use std::fmt::Write;
        let mut buf = String::new();

        match &self.start {
            StartLine::Request { method, uri } => {
                let _ = write!(buf, "{} {} SIP/2.0\r\n", method.as_str(), uri);
            }
            StartLine::Response { code, reason } => {
                let _ = write!(buf, "SIP/2.0 {} {}\r\n", code, reason);
            }
        }

        for header in self.headers.iter() {
            let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
        }
        if !self.headers.contains("Content-Length") {
            let _ = write!(buf, "Content-Length: {}\r\n", self.body.len());
        }
        buf.push_str("\r\n");

        let mut out = BytesMut::with_capacity(buf.len() + self.body.len());
        out.extend_from_slice(buf.as_bytes());
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}

/// Extracts the `;key=value` parameters trailing a header value.
///
/// The split is the naive one the wire format usually permits: parameters
/// are separated by `;` and the portion before the first `;` is skipped.
/// Quoted parameter values keep their quotes.
pub fn value_parameters(value: &str) -> Vec<(SmolStr, SmolStr)> {
    value
        .split(';')
        .skip(1)
        .map(|p| {
            let p = p.trim();
            match p.find('=') {
                Some(eq) => (SmolStr::new(&p[..eq]), SmolStr::new(&p[eq + 1..])),
                None => (SmolStr::new(p), SmolStr::new("")),
            }
        })
        .collect()
}

/// Splits raw bytes into header text and body slice using the `\r\n\r\n`
/// separator. Without a separator the whole datagram is header text.
fn split_head_body(data: &[u8]) -> Option<(&str, &[u8])> {
    let delim = b"\r\n\r\n";
    if let Some(pos) = data.windows(delim.len()).position(|w| w == delim) {
        let head = std::str::from_utf8(&data[..pos]).ok()?;
        Some((head, &data[pos + delim.len()..]))
    } else {
        let head = std::str::from_utf8(data).ok()?;
        Some((head, &[] as &[u8]))
    }
}

fn parse_request_line(line: &str) -> Option<StartLine> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(|c: char| !c.is_ascii_whitespace()),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line).ok()?;

    if !version_token.eq_ignore_ascii_case("SIP/2.0") {
        return None;
    }
    Some(StartLine::Request {
        method: Method::from_token(method_token),
        uri: SmolStr::new(uri_token),
    })
}

fn parse_status_line(line: &str) -> Option<StartLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line).ok()?;

    Some(StartLine::Response {
        code,
        reason: SmolStr::new(reason.trim()),
    })
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~')
}
