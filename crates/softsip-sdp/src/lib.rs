// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Audio-only SDP subset (RFC 4566) for SIP offer/answer.
//!
//! Only what a voice call needs is modelled: one `m=audio ... RTP/AVP`
//! section, a connection address, the active time, rtpmap attributes, ICE
//! credentials and candidates. Everything else is passed over on parse and
//! never produced on build.

pub mod parse;

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use smol_str::SmolStr;

pub use parse::ParseError;

/// ICE component id for RTP.
pub const RTP_COMPONENT: u8 = 1;
/// ICE component id for RTCP.
pub const RTCP_COMPONENT: u8 = 2;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// An RTP payload type, either statically assigned (RFC 3551) or described
/// by an `a=rtpmap` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadType {
    pub id: u8,
    pub name: SmolStr,
    pub clock_rate: u32,
    pub channels: u8,
}

impl PayloadType {
    /// Builds a payload type from the RFC 3551 static assignment table,
    /// or an unnamed placeholder for dynamic ids awaiting an rtpmap.
    pub fn from_id(id: u8) -> PayloadType {
        let (name, clock_rate) = match id {
            0 => ("PCMU", 8000),
            3 => ("GSM", 8000),
            4 => ("G723", 8000),
            8 => ("PCMA", 8000),
            9 => ("G722", 8000),
            15 => ("G728", 8000),
            18 => ("G729", 8000),
            _ => ("", 0),
        };
        PayloadType {
            id,
            name: SmolStr::new(name),
            clock_rate,
            channels: 1,
        }
    }

    /// The `a=rtpmap` encoding part, `name/clock[/channels]`.
    pub fn encoding(&self) -> String {
        if self.channels > 1 {
            format!("{}/{}/{}", self.name, self.clock_rate, self.channels)
        } else {
            format!("{}/{}", self.name, self.clock_rate)
        }
    }
}

/// The candidate type carried after `typ` in a candidate attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
        }
    }

    pub fn from_token(token: &str) -> Option<CandidateKind> {
        match token {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            _ => None,
        }
    }
}

/// An ICE transport candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: SmolStr,
    pub component: u8,
    pub protocol: SmolStr,
    pub priority: u32,
    pub host: IpAddr,
    pub port: u16,
    pub kind: CandidateKind,
}

impl Candidate {
    /// A plain UDP host candidate, the only kind the agent synthesizes.
    pub fn host(component: u8, host: IpAddr, port: u16) -> Candidate {
        Candidate {
            foundation: SmolStr::new("1"),
            component,
            protocol: SmolStr::new("udp"),
            priority: 0,
            host,
            port,
            kind: CandidateKind::Host,
        }
    }
}

/// A parsed or to-be-serialized session description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    pub origin_address: Option<IpAddr>,
    pub session_id: u64,
    /// The `t=` value, verbatim (`"0 0"` for an unbounded session).
    pub active_time: SmolStr,
    pub connection: Option<IpAddr>,
    pub audio_port: u16,
    pub payload_types: Vec<PayloadType>,
    pub ice_user: SmolStr,
    pub ice_password: SmolStr,
    pub ssrc: Option<u32>,
    pub candidates: Vec<Candidate>,
}

impl SessionDescription {
    /// Builds an audio offer or answer around the local media session.
    ///
    /// The `m=` port is taken from the first RTP-component candidate and the
    /// session id is the current time in NTP-epoch seconds, matching what
    /// answering peers expect from an `o=` line.
    pub fn audio_offer(
        local_address: IpAddr,
        active_time: &str,
        ssrc: u32,
        payload_types: Vec<PayloadType>,
        ice_user: SmolStr,
        ice_password: SmolStr,
        candidates: Vec<Candidate>,
    ) -> SessionDescription {
        let audio_port = candidates
            .iter()
            .find(|c| c.component == RTP_COMPONENT)
            .map(|c| c.port)
            .unwrap_or(0);
        SessionDescription {
            origin_address: Some(local_address),
            session_id: ntp_seconds(),
            active_time: SmolStr::new(active_time),
            connection: Some(local_address),
            audio_port,
            payload_types,
            ice_user,
            ice_password,
            ssrc: Some(ssrc),
            candidates,
        }
    }

    /// Parses the SDP subset; see [`parse::parse`].
    pub fn parse(input: &str) -> Result<SessionDescription, ParseError> {
        parse::parse(input)
    }

    /// Serializes the description with CRLF line endings.
    pub fn to_sdp(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        out.push_str("v=0\r\n");
        if let Some(origin) = self.origin_address {
            let _ = write!(
                out,
                "o=- {} {} {}\r\n",
                self.session_id,
                self.session_id,
                address_to_sdp(origin)
            );
        }
        out.push_str("s=-\r\n");
        let _ = write!(out, "t={}\r\n", self.active_time);

        let _ = write!(out, "m=audio {} RTP/AVP", self.audio_port);
        for pt in &self.payload_types {
            let _ = write!(out, " {}", pt.id);
        }
        out.push_str("\r\n");
        if let Some(connection) = self.connection {
            let _ = write!(out, "c={}\r\n", address_to_sdp(connection));
        }
        for pt in &self.payload_types {
            if !pt.name.is_empty() {
                let _ = write!(out, "a=rtpmap:{} {}\r\n", pt.id, pt.encoding());
            }
        }
        for c in &self.candidates {
            let _ = write!(
                out,
                "a=candidate:{} {} {} {} {} {} typ {}\r\n",
                c.foundation,
                c.component,
                c.protocol,
                c.priority,
                c.host,
                c.port,
                c.kind.as_str()
            );
        }
        if !self.ice_user.is_empty() {
            let _ = write!(out, "a=ice-ufrag:{}\r\n", self.ice_user);
        }
        if !self.ice_password.is_empty() {
            let _ = write!(out, "a=ice-pwd:{}\r\n", self.ice_password);
        }
        if let Some(ssrc) = self.ssrc {
            let _ = write!(out, "a=ssrc:{}\r\n", ssrc);
        }
        out
    }
}

fn address_to_sdp(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => format!("IN IP4 {}", v4),
        IpAddr::V6(v6) => format!("IN IP6 {}", v6),
    }
}

/// Current time in seconds since the NTP epoch.
pub fn ntp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() + NTP_UNIX_OFFSET)
        .unwrap_or(NTP_UNIX_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_has_exactly_one_audio_section() {
        let sdp = SessionDescription::audio_offer(
            "192.0.2.1".parse().unwrap(),
            "0 0",
            0x1234,
            vec![PayloadType::from_id(0), PayloadType::from_id(8)],
            SmolStr::new("user"),
            SmolStr::new("pass"),
            vec![
                Candidate::host(RTP_COMPONENT, "192.0.2.1".parse().unwrap(), 40000),
                Candidate::host(RTCP_COMPONENT, "192.0.2.1".parse().unwrap(), 40001),
            ],
        )
        .to_sdp();

        assert_eq!(sdp.matches("m=audio").count(), 1);
        assert!(sdp.contains("m=audio 40000 RTP/AVP 0 8\r\n"));
        assert!(sdp.contains("c=IN IP4 192.0.2.1\r\n"));
        assert!(sdp.contains("t=0 0\r\n"));
        assert!(sdp.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(sdp.contains("a=ice-ufrag:user\r\n"));
        assert!(sdp.contains("a=ice-pwd:pass\r\n"));
    }

    #[test]
    fn offer_round_trips_through_the_parser() {
        let offer = SessionDescription::audio_offer(
            "192.0.2.1".parse().unwrap(),
            "3920000000 0",
            7,
            vec![PayloadType::from_id(0)],
            SmolStr::new("u"),
            SmolStr::new("p"),
            vec![Candidate::host(
                RTP_COMPONENT,
                "192.0.2.1".parse().unwrap(),
                40000,
            )],
        );
        let parsed = SessionDescription::parse(&offer.to_sdp()).unwrap();
        assert_eq!(parsed.audio_port, 40000);
        assert_eq!(parsed.active_time, "3920000000 0");
        assert_eq!(parsed.connection, offer.connection);
        assert_eq!(parsed.payload_types, offer.payload_types);
        assert_eq!(parsed.candidates, offer.candidates);
        assert_eq!(parsed.ice_user, "u");
        assert_eq!(parsed.ice_password, "p");
        assert_eq!(parsed.ssrc, Some(7));
    }

    #[test]
    fn static_payload_table_covers_g711() {
        assert_eq!(PayloadType::from_id(0).encoding(), "PCMU/8000");
        assert_eq!(PayloadType::from_id(8).encoding(), "PCMA/8000");
        assert!(PayloadType::from_id(96).name.is_empty());
    }
}
