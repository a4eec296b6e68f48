// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 2617 MD5 digest authentication.
//!
//! Challenge values arrive as comma-separated `key="value"` lists inside
//! `WWW-Authenticate` / `Proxy-Authenticate` headers; this crate parses and
//! serializes that shape and computes `Authorization` header values.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use smol_str::SmolStr;

/// Parses a comma-separated list of `key=value` / `key="value"` digest
/// fields.
///
/// Quoted values honor `\"` and `\\` escapes. An unterminated quoted string
/// aborts the scan; the fields parsed before it are returned.
pub fn parse_digest_fields(input: &str) -> BTreeMap<SmolStr, SmolStr> {
    let mut fields = BTreeMap::new();
    let mut rest = input.trim_start();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim();
        rest = &rest[eq + 1..];

        let value = if let Some(tail) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut closed = None;
            let mut chars = tail.char_indices();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        closed = Some(i);
                        break;
                    }
                    other => out.push(other),
                }
            }
            let Some(end) = closed else { break };
            rest = &tail[end + 1..];
            out
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let out = rest[..end].trim().to_owned();
            rest = &rest[end..];
            out
        };

        fields.insert(SmolStr::new(key), SmolStr::new(value));
        rest = rest.trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }
    fields
}

/// Serializes digest fields back to the wire shape, quoting every value and
/// escaping `"` and `\`.
pub fn serialize_digest_fields(fields: &BTreeMap<SmolStr, SmolStr>) -> SmolStr {
    let mut out = String::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(key);
        out.push_str("=\"");
        for c in value.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
    }
    SmolStr::new(out)
}

/// A digest challenge extracted from a `WWW-Authenticate` or
/// `Proxy-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub fields: BTreeMap<SmolStr, SmolStr>,
}

impl Challenge {
    /// Parses a challenge header value, rejecting schemes other than
    /// `Digest`.
    pub fn parse_header(value: &str) -> Option<Challenge> {
        let value = value.trim_start();
        let (scheme, rest) = value.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return None;
        }
        Some(Challenge {
            fields: parse_digest_fields(rest),
        })
    }

    pub fn realm(&self) -> &str {
        self.fields.get("realm").map(SmolStr::as_str).unwrap_or("")
    }

    pub fn nonce(&self) -> &str {
        self.fields.get("nonce").map(SmolStr::as_str).unwrap_or("")
    }

    /// True when the challenge offers the `auth` quality of protection.
    pub fn offers_qop_auth(&self) -> bool {
        self.fields
            .get("qop")
            .map(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Username and password for one account.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: SmolStr,
    pub password: SmolStr,
}

impl DigestCredentials {
    /// Computes a full `Digest ...` authorization header value answering the
    /// given challenge for one request.
    ///
    /// When the challenge offers `qop=auth` the response includes a fresh
    /// cnonce and `nc=00000001`; each answered request is a new transaction
    /// so the nonce count never advances. An `opaque` field is echoed back.
    pub fn authorization(&self, method: &str, uri: &str, challenge: &Challenge) -> SmolStr {
        let ha1 = ha1(&self.username, challenge.realm(), &self.password);
        let ha2 = ha2(method, uri);

        let mut fields = BTreeMap::new();
        fields.insert(SmolStr::new("username"), self.username.clone());
        fields.insert(SmolStr::new("realm"), SmolStr::new(challenge.realm()));
        fields.insert(SmolStr::new("nonce"), SmolStr::new(challenge.nonce()));
        fields.insert(SmolStr::new("uri"), SmolStr::new(uri));
        fields.insert(SmolStr::new("algorithm"), SmolStr::new("MD5"));
        if let Some(opaque) = challenge.fields.get("opaque") {
            fields.insert(SmolStr::new("opaque"), opaque.clone());
        }

        let response = if challenge.offers_qop_auth() {
            let cnonce = generate_cnonce();
            let nc = "00000001";
            let response = digest_response(
                &ha1,
                challenge.nonce(),
                &ha2,
                Some((nc, cnonce.as_str())),
            );
            fields.insert(SmolStr::new("qop"), SmolStr::new("auth"));
            fields.insert(SmolStr::new("nc"), SmolStr::new(nc));
            fields.insert(SmolStr::new("cnonce"), cnonce);
            response
        } else {
            digest_response(&ha1, challenge.nonce(), &ha2, None)
        };
        fields.insert(SmolStr::new("response"), response);

        SmolStr::new(format!("Digest {}", serialize_digest_fields(&fields)))
    }
}

/// MD5 of `username:realm:password`, lowercase hex.
pub fn ha1(username: &str, realm: &str, password: &str) -> SmolStr {
    md5_hex(format!("{}:{}:{}", username, realm, password).as_bytes())
}

/// MD5 of `method:uri`, lowercase hex.
pub fn ha2(method: &str, uri: &str) -> SmolStr {
    md5_hex(format!("{}:{}", method, uri).as_bytes())
}

/// The digest response value, with or without `qop=auth` material.
pub fn digest_response(
    ha1: &str,
    nonce: &str,
    ha2: &str,
    qop_auth: Option<(&str, &str)>,
) -> SmolStr {
    let input = match qop_auth {
        Some((nc, cnonce)) => {
            format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2)
        }
        None => format!("{}:{}:{}", ha1, nonce, ha2),
    };
    md5_hex(input.as_bytes())
}

fn generate_cnonce() -> SmolStr {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    SmolStr::new(BASE64.encode(raw))
}

fn md5_hex(data: &[u8]) -> SmolStr {
    SmolStr::new(format!("{:x}", md5::compute(data)))
}
