//! SDP subset parser.
//!
//! Walks the description line by line with nom combinators for the fields a
//! voice call cares about and skips everything else.

use std::net::IpAddr;

use nom::{
    bytes::complete::{tag, take_till},
    character::complete::{space1, u16 as nom_u16, u32 as nom_u32, u8 as nom_u8},
    combinator::{map_res, opt, rest},
    multi::many1,
    sequence::{preceded, tuple},
    IResult,
};
use smol_str::SmolStr;

use crate::{Candidate, CandidateKind, PayloadType, SessionDescription};

/// SDP subset parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No `m=audio ... RTP/AVP` section was found.
    MissingAudioMedia,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingAudioMedia => {
                write!(f, "no audio RTP/AVP media section in SDP")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses an SDP body, extracting connection address, the audio media
/// section, active time, rtpmap attributes, ICE credentials and candidates.
///
/// Unknown lines and non-audio media sections are skipped. The only hard
/// requirement is one `m=audio ... RTP/AVP` line.
pub fn parse(input: &str) -> Result<SessionDescription, ParseError> {
    let mut desc = SessionDescription::default();
    let mut saw_audio = false;

    for raw in input.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(value) = line.strip_prefix("c=") {
            if let Some(addr) = parse_connection(value) {
                desc.connection = Some(addr);
            }
        } else if let Some(value) = line.strip_prefix("m=") {
            if let Ok((_, (port, formats))) = audio_media(value) {
                saw_audio = true;
                desc.audio_port = port;
                desc.payload_types = formats.into_iter().map(PayloadType::from_id).collect();
            }
        } else if let Some(value) = line.strip_prefix("t=") {
            desc.active_time = SmolStr::new(value);
        } else if let Some(value) = line.strip_prefix("a=") {
            parse_attribute(value, &mut desc);
        }
    }

    if !saw_audio {
        return Err(ParseError::MissingAudioMedia);
    }
    Ok(desc)
}

fn parse_connection(value: &str) -> Option<IpAddr> {
    let addr = value
        .strip_prefix("IN IP4 ")
        .or_else(|| value.strip_prefix("IN IP6 "))?;
    addr.trim().parse().ok()
}

fn parse_attribute(value: &str, desc: &mut SessionDescription) {
    let Some((name, value)) = value.split_once(':') else {
        return;
    };
    match name {
        "rtpmap" => {
            if let Ok((_, (id, encoding, clock_rate, channels))) = rtpmap(value) {
                if let Some(pt) = desc.payload_types.iter_mut().find(|pt| pt.id == id) {
                    pt.name = SmolStr::new(encoding);
                    pt.clock_rate = clock_rate;
                    pt.channels = channels.unwrap_or(1);
                }
            }
        }
        "candidate" => {
            if let Ok((_, candidate)) = candidate(value) {
                desc.candidates.push(candidate);
            }
        }
        "ice-ufrag" => desc.ice_user = SmolStr::new(value),
        "ice-pwd" => desc.ice_password = SmolStr::new(value),
        "ssrc" => {
            desc.ssrc = value.split_whitespace().next().and_then(|v| v.parse().ok());
        }
        _ => {}
    }
}

/// `audio <port> RTP/AVP <fmt>...` after the `m=` prefix.
fn audio_media(input: &str) -> IResult<&str, (u16, Vec<u8>)> {
    let (input, (_, _, port, _, _, formats)) = tuple((
        tag("audio"),
        space1,
        nom_u16,
        space1,
        tag("RTP/AVP"),
        many1(preceded(space1, nom_u8)),
    ))(input)?;
    Ok((input, (port, formats)))
}

/// `<id> <name>/<clock>[/<channels>]` after the `rtpmap:` prefix.
fn rtpmap(input: &str) -> IResult<&str, (u8, &str, u32, Option<u8>)> {
    let (input, (id, _, name, _, clock_rate, channels)) = tuple((
        nom_u8,
        space1,
        take_till(|c| c == '/'),
        tag("/"),
        nom_u32,
        opt(preceded(tag("/"), nom_u8)),
    ))(input)?;
    Ok((input, (id, name, clock_rate, channels)))
}

/// `<foundation> <component> <protocol> <priority> <host> <port> typ <kind>`
/// after the `candidate:` prefix.
fn candidate(input: &str) -> IResult<&str, Candidate> {
    let (input, (foundation, _, component, _, protocol, _, priority, _, host, _, port, _, _, _, kind)) =
        tuple((
            take_till(|c| c == ' '),
            space1,
            nom_u8,
            space1,
            take_till(|c| c == ' '),
            space1,
            nom_u32,
            space1,
            map_res(take_till(|c| c == ' '), |s: &str| s.parse::<IpAddr>()),
            space1,
            nom_u16,
            space1,
            tag("typ"),
            space1,
            map_res(rest, |s: &str| {
                CandidateKind::from_token(s.split_whitespace().next().unwrap_or(""))
                    .ok_or("unknown candidate type")
            }),
        ))(input)?;
    Ok((
        input,
        Candidate {
            foundation: SmolStr::new(foundation),
            component,
            protocol: SmolStr::new(protocol),
            priority,
            host,
            port,
            kind,
        },
    ))
}
