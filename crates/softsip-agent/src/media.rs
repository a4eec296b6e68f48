// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Media collaborator contracts.
//!
//! The engine negotiates media but never moves RTP itself; it talks to the
//! transport through these traits. [`StaticMediaFactory`] is a signaling-only
//! implementation used by the demo binary and the engine tests: it advertises
//! fixed G.711 candidates and never opens a socket.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use rand::Rng;
use smol_str::SmolStr;
use softsip_sdp::{Candidate, PayloadType, RTCP_COMPONENT, RTP_COMPONENT};

use crate::events::CallId;

/// Callback the engine uses to learn that a session finished gathering;
/// the driver bridges it onto its input channel.
pub type GatheringSink = Arc<dyn Fn(CallId) + Send + Sync>;

/// ICE-style transport half of a call's media.
pub trait MediaSession: Send {
    fn local_user(&self) -> SmolStr;
    fn local_password(&self) -> SmolStr;
    fn local_candidates(&self) -> Vec<Candidate>;
    /// True once every local candidate has been gathered. The engine defers
    /// the INVITE until this holds.
    fn gathering_complete(&self) -> bool;
    /// Registers a hook fired once gathering completes. Only called while
    /// `gathering_complete` is false; a hook fires at most once.
    fn on_gathering_complete(&mut self, notify: Box<dyn FnOnce() + Send>);
    fn set_remote_credentials(&mut self, user: &str, password: &str);
    fn add_remote_candidate(&mut self, candidate: Candidate);
    fn close(&mut self);
}

/// RTP audio half of a call's media.
pub trait AudioChannel: Send {
    fn local_ssrc(&self) -> u32;
    fn local_payload_types(&self) -> Vec<PayloadType>;
    fn set_remote_payload_types(&mut self, payload_types: &[PayloadType]);
    /// True when a usable codec has been agreed on and the channel is not
    /// closed.
    fn is_open(&self) -> bool;
}

/// Creates the media collaborators for one call.
pub trait MediaFactory: Send {
    fn create(&self, controlling: bool) -> (Box<dyn MediaSession>, Box<dyn AudioChannel>);
}

struct MediaState {
    ice_user: SmolStr,
    ice_password: SmolStr,
    ssrc: u32,
    local_candidates: Vec<Candidate>,
    local_payload_types: Vec<PayloadType>,
    remote_user: SmolStr,
    remote_password: SmolStr,
    remote_candidates: Vec<Candidate>,
    remote_payload_types: Vec<PayloadType>,
    gathering_done: bool,
    gathering_hooks: Vec<Box<dyn FnOnce() + Send>>,
    closed: bool,
}

/// A handle onto one static media session; both collaborator traits are
/// implemented on the same shared state.
#[derive(Clone)]
pub struct SharedMedia(Arc<Mutex<MediaState>>);

impl SharedMedia {
    fn new(host: IpAddr, rtp_port: u16, gathering_done: bool) -> SharedMedia {
        let mut rng = rand::thread_rng();
        SharedMedia(Arc::new(Mutex::new(MediaState {
            ice_user: random_token(&mut rng, 4),
            ice_password: random_token(&mut rng, 22),
            ssrc: rng.gen(),
            local_candidates: vec![
                Candidate::host(RTP_COMPONENT, host, rtp_port),
                Candidate::host(RTCP_COMPONENT, host, rtp_port + 1),
            ],
            local_payload_types: vec![PayloadType::from_id(0), PayloadType::from_id(8)],
            remote_user: SmolStr::default(),
            remote_password: SmolStr::default(),
            remote_candidates: Vec::new(),
            remote_payload_types: Vec::new(),
            gathering_done,
            gathering_hooks: Vec::new(),
            closed: false,
        })))
    }

    /// Marks gathering as finished and fires any registered hooks.
    pub fn finish_gathering(&self) {
        let hooks = {
            let mut state = self.0.lock().unwrap();
            state.gathering_done = true;
            std::mem::take(&mut state.gathering_hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    /// Remote candidates seen so far, in arrival order.
    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.0.lock().unwrap().remote_candidates.clone()
    }

    pub fn remote_user(&self) -> SmolStr {
        self.0.lock().unwrap().remote_user.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

impl MediaSession for SharedMedia {
    fn local_user(&self) -> SmolStr {
        self.0.lock().unwrap().ice_user.clone()
    }

    fn local_password(&self) -> SmolStr {
        self.0.lock().unwrap().ice_password.clone()
    }

    fn local_candidates(&self) -> Vec<Candidate> {
        self.0.lock().unwrap().local_candidates.clone()
    }

    fn gathering_complete(&self) -> bool {
        self.0.lock().unwrap().gathering_done
    }

    fn on_gathering_complete(&mut self, notify: Box<dyn FnOnce() + Send>) {
        let mut state = self.0.lock().unwrap();
        if state.gathering_done {
            drop(state);
            notify();
        } else {
            state.gathering_hooks.push(notify);
        }
    }

    fn set_remote_credentials(&mut self, user: &str, password: &str) {
        let mut state = self.0.lock().unwrap();
        state.remote_user = SmolStr::new(user);
        state.remote_password = SmolStr::new(password);
    }

    fn add_remote_candidate(&mut self, candidate: Candidate) {
        self.0.lock().unwrap().remote_candidates.push(candidate);
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed = true;
    }
}

impl AudioChannel for SharedMedia {
    fn local_ssrc(&self) -> u32 {
        self.0.lock().unwrap().ssrc
    }

    fn local_payload_types(&self) -> Vec<PayloadType> {
        self.0.lock().unwrap().local_payload_types.clone()
    }

    fn set_remote_payload_types(&mut self, payload_types: &[PayloadType]) {
        self.0.lock().unwrap().remote_payload_types = payload_types.to_vec();
    }

    fn is_open(&self) -> bool {
        let state = self.0.lock().unwrap();
        !state.closed
            && state
                .remote_payload_types
                .iter()
                .any(|remote| state.local_payload_types.iter().any(|l| l.id == remote.id))
    }
}

/// Factory handing out [`SharedMedia`] sessions at a fixed host address.
///
/// Each call gets the same RTP/RTCP port pair; the factory keeps a handle on
/// every session it created so tests can inspect the negotiated state.
pub struct StaticMediaFactory {
    host: IpAddr,
    rtp_port: u16,
    deferred: bool,
    created: Mutex<Vec<SharedMedia>>,
}

impl StaticMediaFactory {
    pub fn new(host: IpAddr, rtp_port: u16) -> StaticMediaFactory {
        StaticMediaFactory {
            host,
            rtp_port,
            deferred: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// New sessions start with gathering in progress; it completes only
    /// when [`SharedMedia::finish_gathering`] is called.
    pub fn defer_gathering(mut self) -> StaticMediaFactory {
        self.deferred = true;
        self
    }

    /// Handles onto every session created so far.
    pub fn sessions(&self) -> Vec<SharedMedia> {
        self.created.lock().unwrap().clone()
    }
}

impl MediaFactory for StaticMediaFactory {
    fn create(&self, _controlling: bool) -> (Box<dyn MediaSession>, Box<dyn AudioChannel>) {
        let media = SharedMedia::new(self.host, self.rtp_port, !self.deferred);
        self.created.lock().unwrap().push(media.clone());
        (Box::new(media.clone()), Box::new(media))
    }
}

fn random_token(rng: &mut impl Rng, len: usize) -> SmolStr {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let token: String = (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    SmolStr::new(token)
}
