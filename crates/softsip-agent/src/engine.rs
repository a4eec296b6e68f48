// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The client engine: registration, STUN discovery, and call handling as a
//! pure state machine.
//!
//! The engine owns no socket, timer, or resolver. Every stimulus arrives as
//! an [`Input`] and every effect leaves as an [`Action`]; the tokio driver
//! translates between the two. This keeps the protocol behaviour fully
//! deterministic under test: feed datagrams and timer events, assert on the
//! actions that come back.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use softsip_core::{value_parameters, Method, SipMessage};
use softsip_digest::DigestCredentials;
use softsip_sdp::{Candidate, SessionDescription, RTCP_COMPONENT, RTP_COMPONENT};
use softsip_stun::StunMessage;
use softsip_transaction::{
    branch_from_via, generate_branch, ClientTransaction, TransactionAction, TransactionEvent,
};

use crate::context::CallContext;
use crate::events::{CallDirection, CallId, CallState, ClientState, SipClientEvent};
use crate::media::{AudioChannel, GatheringSink, MediaFactory, MediaSession};

const CONNECT_RETRY: Duration = Duration::from_secs(60);
const STUN_RETRY: Duration = Duration::from_millis(500);
const STUN_KEEPALIVE: Duration = Duration::from_secs(30);
const INVITE_TIMEOUT: Duration = softsip_transaction::TIMEOUT;
const REGISTER_EXPIRES: u32 = 120;
const REGISTER_MARGIN: i64 = 10;
const ALLOW_METHODS: &str = "INVITE, ACK, CANCEL, OPTIONS, BYE";

/// Account and identity configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: SmolStr,
    pub password: SmolStr,
    pub domain: SmolStr,
    pub display_name: SmolStr,
    pub user_agent: SmolStr,
    /// Address the driver connects a throwaway UDP socket to when picking
    /// the local interface; no traffic is sent to it. Defaults to a public
    /// DNS server, override for air-gapped networks.
    pub probe_address: SocketAddr,
}

impl ClientConfig {
    pub fn new(username: &str, password: &str, domain: &str) -> ClientConfig {
        ClientConfig {
            username: SmolStr::new(username),
            password: SmolStr::new(password),
            domain: SmolStr::new(domain),
            display_name: SmolStr::default(),
            user_agent: SmolStr::new(concat!("softsip/", env!("CARGO_PKG_VERSION"))),
            probe_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
        }
    }
}

/// Which server a resolution step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Sip,
    Stun,
}

/// Timers the engine asks the driver to run.
///
/// Starting a timer that is already pending reschedules it; stopping an
/// unknown timer is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Periodic connect attempt while registration has not succeeded.
    ConnectRetry,
    /// STUN retransmit (before a response) or keepalive (after one).
    Stun,
    /// Scheduled re-registration before the binding expires.
    Register,
    TransactionRetry(SmolStr),
    TransactionTimeout(SmolStr),
    /// No final answer to an INVITE within 64*T1.
    InviteTimeout(CallId),
    DurationTick(CallId),
}

/// Stimuli fed into the engine by the driver.
#[derive(Debug, Clone)]
pub enum Input {
    Datagram { payload: Bytes, source: SocketAddr },
    Timer(Timer),
    /// SRV lookup outcome; empty targets mean the lookup failed.
    SrvResolved {
        service: Service,
        targets: Vec<(SmolStr, u16)>,
    },
    HostResolved {
        service: Service,
        address: Option<IpAddr>,
    },
    /// The local interface address was re-discovered after a reflexive
    /// address change.
    LocalAddressRefreshed(IpAddr),
    /// A call's media session finished gathering candidates.
    GatheringComplete { call: CallId },
}

/// Effects the driver must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { payload: Bytes, to: SocketAddr },
    Start { timer: Timer, after: Duration },
    Stop(Timer),
    ResolveSrv { service: Service, name: SmolStr },
    ResolveHost { service: Service, name: SmolStr },
    /// Re-discover the local interface address and answer with
    /// [`Input::LocalAddressRefreshed`].
    RefreshLocalAddress,
    Emit(SipClientEvent),
}

struct Call {
    context: CallContext,
    direction: CallDirection,
    state: CallState,
    remote_recipient: SmolStr,
    remote_uri: SmolStr,
    remote_route: Vec<SmolStr>,
    active_time: SmolStr,
    invite_pending: bool,
    invite_queued: bool,
    invite_request: Option<SipMessage>,
    error: Option<SmolStr>,
    duration_secs: u64,
    transactions: Vec<ClientTransaction>,
    media: Box<dyn MediaSession>,
    audio: Box<dyn AudioChannel>,
}

/// The SIP user agent state machine.
pub struct ClientEngine {
    config: ClientConfig,
    media_factory: Box<dyn MediaFactory>,
    state: ClientState,
    context: CallContext,
    local_address: IpAddr,
    local_port: u16,
    server: Option<SocketAddr>,
    sip_port: u16,
    stun_server: Option<SocketAddr>,
    stun_port: u16,
    stun_id: Option<[u8; 12]>,
    stun_done: bool,
    stun_reflexive: Option<SocketAddr>,
    register_after_refresh: bool,
    gathering_sink: Option<GatheringSink>,
    transactions: Vec<ClientTransaction>,
    calls: Vec<Call>,
}

impl ClientEngine {
    pub fn new(
        config: ClientConfig,
        media_factory: Box<dyn MediaFactory>,
        local_address: IpAddr,
        local_port: u16,
    ) -> ClientEngine {
        ClientEngine {
            config,
            media_factory,
            state: ClientState::Disconnected,
            context: CallContext::new(),
            local_address,
            local_port,
            server: None,
            sip_port: 5060,
            stun_server: None,
            stun_port: 3478,
            stun_id: None,
            stun_done: false,
            stun_reflexive: None,
            register_after_refresh: false,
            gathering_sink: None,
            transactions: Vec::new(),
            calls: Vec::new(),
        }
    }

    /// Installs the callback media sessions use to report finished
    /// gathering. The driver feeds it back as [`Input::GatheringComplete`].
    pub fn set_gathering_sink(&mut self, sink: GatheringSink) {
        self.gathering_sink = Some(sink);
    }

    pub fn client_state(&self) -> ClientState {
        self.state
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn call_state(&self, call: &CallId) -> Option<CallState> {
        self.call_index(call).map(|ci| self.calls[ci].state)
    }

    /// Starts connecting: server discovery, STUN, then registration.
    pub fn connect(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.connect_to_server(&mut out);
        out
    }

    /// Hangs up every call and unregisters when currently registered.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut out = vec![
            Action::Stop(Timer::ConnectRetry),
            Action::Stop(Timer::Stun),
            Action::Stop(Timer::Register),
        ];
        self.stun_done = false;

        let ids: Vec<CallId> = self.calls.iter().map(|c| c.context.id.clone()).collect();
        for id in ids {
            let actions = self.hangup(&id);
            out.extend(actions);
        }

        if self.state == ClientState::Connected {
            if let Some(server) = self.server {
                debug!("disconnecting from SIP server {}", server);
            }
            let uri = format!("sip:{}", self.config.domain);
            let cseq = self.context.next_cseq();
            let mut request = self.build_request(Method::Register, &uri, &self.context, cseq);
            let contact = request.header("Contact").unwrap_or_default();
            request.set_header("Contact", format!("{};expires=0", contact));
            self.start_client_transaction(request, &mut out);
            self.set_state(ClientState::Disconnecting, &mut out);
        } else {
            self.set_state(ClientState::Disconnected, &mut out);
        }
        out
    }

    /// Places an outgoing call; returns its id once created.
    pub fn call(&mut self, recipient: &str) -> (Option<CallId>, Vec<Action>) {
        let mut out = Vec::new();
        if self.state != ClientState::Connected {
            warn!("cannot dial call, not connected to server");
            return (None, out);
        }

        let (media, audio) = self.media_factory.create(true);
        let context = CallContext::new();
        let id = context.id.clone();
        let remote_uri = match sip_address_to_uri(recipient) {
            Some(uri) => uri,
            None => {
                warn!("bad address {}", recipient);
                return (None, out);
            }
        };
        info!("SIP call {} to {}", id, recipient);

        self.calls.push(Call {
            context,
            direction: CallDirection::Outgoing,
            state: CallState::Connecting,
            remote_recipient: SmolStr::new(recipient),
            remote_uri,
            remote_route: Vec::new(),
            active_time: SmolStr::new("0 0"),
            invite_pending: false,
            invite_queued: true,
            invite_request: None,
            error: None,
            duration_secs: 0,
            transactions: Vec::new(),
            media,
            audio,
        });
        out.push(Action::Emit(SipClientEvent::ActiveCallsChanged(
            self.calls.len(),
        )));

        let ci = self.calls.len() - 1;
        if self.calls[ci].media.gathering_complete() {
            self.calls[ci].invite_queued = false;
            self.send_invite(ci, &mut out);
        } else if let Some(sink) = &self.gathering_sink {
            // the INVITE stays queued until the session reports completion
            let sink = Arc::clone(sink);
            let call = id.clone();
            self.calls[ci]
                .media
                .on_gathering_complete(Box::new(move || sink(call)));
        }
        (Some(id), out)
    }

    /// Accepts an incoming call with a 200 carrying the SDP answer.
    pub fn accept(&mut self, call: &CallId) -> Vec<Action> {
        let mut out = Vec::new();
        let Some(ci) = self.call_index(call) else {
            warn!("cannot accept unknown call {}", call);
            return out;
        };
        if self.calls[ci].direction != CallDirection::Incoming
            || self.calls[ci].state != CallState::Connecting
        {
            return out;
        }
        let Some(invite) = self.calls[ci].invite_request.clone() else {
            return out;
        };

        let sdp = Self::build_sdp(self.local_address, &self.calls[ci]);
        let mut response = self.build_response(&invite, 200, "OK");
        response.set_header("Allow", ALLOW_METHODS);
        response.set_header("Supported", "replaces");
        response.set_header("Content-Type", "application/sdp");
        response.body = Bytes::from(sdp);
        self.send_message(&response, &mut out);
        out
    }

    /// Hangs up a call with a BYE. A second hangup on the same call is a
    /// no-op.
    pub fn hangup(&mut self, call: &CallId) -> Vec<Action> {
        let mut out = Vec::new();
        let Some(ci) = self.call_index(call) else {
            return out;
        };
        if matches!(
            self.calls[ci].state,
            CallState::Disconnecting | CallState::Finished
        ) {
            return out;
        }
        debug!("SIP call {} hangup", call);
        self.set_call_state(call, CallState::Disconnecting, &mut out);

        let Some(ci) = self.call_index(call) else {
            return out;
        };
        self.calls[ci].media.close();
        out.push(Action::Stop(Timer::InviteTimeout(call.clone())));

        let uri = self.calls[ci].remote_uri.clone();
        let recipient = self.calls[ci].remote_recipient.clone();
        let route = self.calls[ci].remote_route.clone();
        let cseq = self.calls[ci].context.next_cseq();
        let mut request = self.build_request(Method::Bye, &uri, &self.calls[ci].context, cseq);
        request.set_header("To", recipient);
        for hop in route.iter().rev() {
            request.add_header("Route", hop.clone());
        }
        self.start_call_transaction(ci, request, &mut out);
        out
    }

    /// Feeds one stimulus through the state machine.
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::Datagram { payload, source } => self.handle_datagram(payload, source, &mut out),
            Input::Timer(timer) => self.handle_timer(timer, &mut out),
            Input::SrvResolved { service, targets } => self.handle_srv(service, targets, &mut out),
            Input::HostResolved { service, address } => {
                self.handle_host(service, address, &mut out)
            }
            Input::LocalAddressRefreshed(address) => {
                self.local_address = address;
                if self.register_after_refresh {
                    self.register_after_refresh = false;
                    self.register(&mut out);
                }
            }
            Input::GatheringComplete { call } => {
                if let Some(ci) = self.call_index(&call) {
                    if self.calls[ci].invite_queued && self.calls[ci].media.gathering_complete() {
                        self.calls[ci].invite_queued = false;
                        self.send_invite(ci, &mut out);
                    }
                }
            }
        }
        out
    }

    // ---- connection and registration ----

    fn connect_to_server(&mut self, out: &mut Vec<Action>) {
        out.push(Action::Start {
            timer: Timer::ConnectRetry,
            after: CONNECT_RETRY,
        });
        debug!("looking up STUN server for domain {}", self.config.domain);
        out.push(Action::ResolveSrv {
            service: Service::Stun,
            name: SmolStr::new(format!("_stun._udp.{}", self.config.domain)),
        });
        debug!("looking up SIP server for domain {}", self.config.domain);
        out.push(Action::ResolveSrv {
            service: Service::Sip,
            name: SmolStr::new(format!("_sip._udp.{}", self.config.domain)),
        });
    }

    fn handle_srv(
        &mut self,
        service: Service,
        targets: Vec<(SmolStr, u16)>,
        out: &mut Vec<Action>,
    ) {
        let (host, port) = targets.into_iter().next().unwrap_or_else(|| match service {
            Service::Sip => (SmolStr::new(format!("sip.{}", self.config.domain)), 5060),
            Service::Stun => (SmolStr::new(format!("stun.{}", self.config.domain)), 3478),
        });
        match service {
            Service::Sip => self.sip_port = port,
            Service::Stun => self.stun_port = port,
        }
        out.push(Action::ResolveHost {
            service,
            name: host,
        });
    }

    fn handle_host(&mut self, service: Service, address: Option<IpAddr>, out: &mut Vec<Action>) {
        let Some(address) = address else {
            warn!("could not look up {:?} server", service);
            return;
        };
        match service {
            Service::Sip => {
                self.server = Some(SocketAddr::new(address, self.sip_port));
                if self.stun_done {
                    self.register(out);
                }
            }
            Service::Stun => {
                self.stun_server = Some(SocketAddr::new(address, self.stun_port));
                self.send_stun(out);
            }
        }
    }

    fn register(&mut self, out: &mut Vec<Action>) {
        let Some(server) = self.server else {
            return;
        };
        debug!("connecting to SIP server {}", server);
        let uri = format!("sip:{}", self.config.domain);
        let cseq = self.context.next_cseq();
        let mut request = self.build_request(Method::Register, &uri, &self.context, cseq);
        request.set_header("Expires", REGISTER_EXPIRES.to_string());
        self.start_client_transaction(request, out);
        self.set_state(ClientState::Connecting, out);
    }

    fn send_stun(&mut self, out: &mut Vec<Action>) {
        let Some(server) = self.stun_server else {
            return;
        };
        let request = StunMessage::binding_request();
        self.stun_id = Some(request.transaction_id);
        out.push(Action::Send {
            payload: request.to_bytes(),
            to: server,
        });
        out.push(Action::Start {
            timer: Timer::Stun,
            after: STUN_RETRY,
        });
    }

    fn handle_stun(&mut self, payload: &[u8], out: &mut Vec<Action>) {
        let message = match StunMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping bad STUN message: {}", err);
                return;
            }
        };
        if let Some(reflexive) = message.reflexive_address() {
            if self.stun_reflexive != Some(reflexive) {
                debug!("STUN reflexive address changed to {}", reflexive);
                self.stun_reflexive = Some(reflexive);
                self.context.clear_challenges();
                self.register_after_refresh = true;
                out.push(Action::RefreshLocalAddress);
            }
        }
        self.stun_done = true;
        out.push(Action::Start {
            timer: Timer::Stun,
            after: STUN_KEEPALIVE,
        });
    }

    fn client_transaction_finished(
        &mut self,
        tx: ClientTransaction,
        response: Option<SipMessage>,
        out: &mut Vec<Action>,
    ) {
        let code = response.as_ref().and_then(|r| r.status_code()).unwrap_or(0);

        if code == 401 {
            if let Some(reply) = &response {
                if self.context.handle_authentication(reply) {
                    let cseq = self.context.next_cseq();
                    let retry = self.build_retry(tx.request(), &self.context, cseq);
                    self.start_client_transaction(retry, out);
                    return;
                }
            }
        }

        if tx.method() != Some(&Method::Register) {
            return;
        }
        if code == 200 {
            if self.state == ClientState::Disconnecting {
                self.set_state(ClientState::Disconnected, out);
            } else if let Some(reply) = response {
                out.push(Action::Stop(Timer::ConnectRetry));
                self.set_state(ClientState::Connected, out);
                self.schedule_reregister(tx.request(), &reply, out);
            }
        } else {
            warn!("register failed");
            if self.state != ClientState::Disconnecting {
                out.push(Action::Start {
                    timer: Timer::ConnectRetry,
                    after: CONNECT_RETRY,
                });
            }
            self.set_state(ClientState::Disconnected, out);
        }
    }

    /// Finds how long the binding lasts and re-registers slightly earlier.
    ///
    /// The expiry preferably comes from the `expires` parameter of the
    /// Contact value matching ours, falling back to the `Expires` header.
    fn schedule_reregister(
        &mut self,
        request: &SipMessage,
        reply: &SipMessage,
        out: &mut Vec<Action>,
    ) {
        let expected = request.header("Contact").unwrap_or_default();
        let mut expire_seconds: i64 = 0;
        for contact in reply.header_values("Contact") {
            if contact.starts_with(expected.as_str()) {
                if let Some((_, value)) = value_parameters(&contact)
                    .into_iter()
                    .find(|(key, _)| key == "expires")
                {
                    expire_seconds = value.parse().unwrap_or(0);
                    if expire_seconds > 0 {
                        break;
                    }
                }
            }
        }
        if expire_seconds <= 0 {
            expire_seconds = reply
                .header("Expires")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }

        if expire_seconds > REGISTER_MARGIN {
            debug!("re-registering in {} seconds", expire_seconds - REGISTER_MARGIN);
            out.push(Action::Start {
                timer: Timer::Register,
                after: Duration::from_secs((expire_seconds - REGISTER_MARGIN) as u64),
            });
        } else {
            warn!(
                "could not schedule next register, expires is too short: {} seconds",
                expire_seconds
            );
        }
    }

    // ---- datagram dispatch ----

    fn handle_datagram(&mut self, payload: Bytes, source: SocketAddr, out: &mut Vec<Action>) {
        if let Some((_, id)) = softsip_stun::peek(&payload) {
            if self.stun_id == Some(id) {
                self.handle_stun(&payload, out);
                return;
            }
        }

        let Some(message) = SipMessage::parse(&payload) else {
            warn!("dropping undecodable datagram from {}", source);
            return;
        };
        let call_id = message.header("Call-ID").unwrap_or_default();

        if message.is_request() {
            if call_id != self.context.id {
                if let Some(ci) = self.call_index(&call_id) {
                    self.call_handle_request(ci, message, out);
                } else if message.method() == Some(&Method::Invite) {
                    self.handle_incoming_invite(message, out);
                }
            }
        } else if call_id == self.context.id {
            self.client_handle_reply(message, out);
        } else if let Some(ci) = self.call_index(&call_id) {
            self.call_handle_reply(ci, message, out);
        }
    }

    fn client_handle_reply(&mut self, reply: SipMessage, out: &mut Vec<Action>) {
        let Some(branch) = reply.header("Via").and_then(|via| branch_from_via(&via)) else {
            return;
        };
        if let Some(ti) = self
            .transactions
            .iter()
            .position(|tx| tx.branch().as_ref() == Some(&branch))
        {
            self.drive_client_transaction(ti, TransactionEvent::Response(reply), out);
        }
    }

    fn handle_incoming_invite(&mut self, mut request: SipMessage, out: &mut Vec<Action>) {
        let from = request.header("From").unwrap_or_default();
        info!("SIP call from {}", from);

        let (media, audio) = self.media_factory.create(false);
        let mut context = CallContext::new();
        context.id = request.header("Call-ID").unwrap_or_default();

        let to = request.header("To").unwrap_or_default();
        match value_parameters(&to)
            .into_iter()
            .find(|(key, _)| key == "tag")
        {
            Some((_, tag)) => context.tag = tag,
            None => request.set_header("To", format!("{};tag={}", to, context.tag)),
        }

        let id = context.id.clone();
        self.calls.push(Call {
            context,
            direction: CallDirection::Incoming,
            state: CallState::Connecting,
            remote_recipient: from.clone(),
            remote_uri: sip_address_to_uri(&from).unwrap_or_default(),
            remote_route: Vec::new(),
            active_time: SmolStr::new("0 0"),
            invite_pending: false,
            invite_queued: false,
            invite_request: None,
            error: None,
            duration_secs: 0,
            transactions: Vec::new(),
            media,
            audio,
        });
        out.push(Action::Emit(SipClientEvent::ActiveCallsChanged(
            self.calls.len(),
        )));

        let ci = self.calls.len() - 1;
        self.call_handle_request(ci, request, out);
        out.push(Action::Emit(SipClientEvent::CallReceived { call: id, from }));
    }

    // ---- per-call handling ----

    fn call_handle_request(&mut self, ci: usize, request: SipMessage, out: &mut Vec<Action>) {
        {
            let call = &mut self.calls[ci];
            if let Some(from) = request.header("From") {
                if !from.is_empty() {
                    call.remote_recipient = from;
                }
            }
            if let Some(contact) = request.header("Contact") {
                if let Some(uri) = sip_address_to_uri(&contact) {
                    call.remote_uri = uri;
                }
            }
            let routes = request.header_values("Record-Route");
            if !routes.is_empty() {
                call.remote_route = routes;
            }
        }
        let id = self.calls[ci].context.id.clone();

        match request.method() {
            Some(Method::Ack) => {
                let open = self.calls[ci].audio.is_open();
                let next = if open {
                    CallState::Active
                } else {
                    CallState::Finished
                };
                self.set_call_state(&id, next, out);
            }
            Some(Method::Bye) | Some(Method::Cancel) => {
                let response = self.build_response(&request, 200, "OK");
                self.send_message(&response, out);
                self.set_call_state(&id, CallState::Finished, out);
            }
            Some(Method::Invite) => {
                let sdp_ok = request.header("Content-Type").as_deref()
                    == Some("application/sdp")
                    && std::str::from_utf8(&request.body)
                        .ok()
                        .map(|body| Self::apply_sdp(&mut self.calls[ci], body))
                        .unwrap_or(false);
                let response = if sdp_ok {
                    self.calls[ci].invite_request = Some(request.clone());
                    self.build_response(&request, 180, "Ringing")
                } else {
                    self.build_response(&request, 400, "Bad request")
                };
                self.send_message(&response, out);
            }
            _ => {
                let response = self.build_response(&request, 405, "Method not allowed");
                self.send_message(&response, out);
            }
        }
    }

    fn call_handle_reply(&mut self, ci: usize, reply: SipMessage, out: &mut Vec<Action>) {
        {
            let call = &mut self.calls[ci];
            if let Some(to) = reply.header("To") {
                if !to.is_empty() {
                    call.remote_recipient = to;
                }
            }
            if let Some(contact) = reply.header("Contact") {
                if let Some(uri) = sip_address_to_uri(&contact) {
                    call.remote_uri = uri;
                }
            }
            let routes = reply.header_values("Record-Route");
            if !routes.is_empty() {
                call.remote_route = routes;
            }
        }
        let id = self.calls[ci].context.id.clone();

        if let Some(branch) = reply.header("Via").and_then(|via| branch_from_via(&via)) {
            if let Some(ti) = self.calls[ci]
                .transactions
                .iter()
                .position(|tx| tx.branch().as_ref() == Some(&branch))
            {
                self.drive_call_transaction(&id, ti, TransactionEvent::Response(reply), out);
                return;
            }
        }

        // from here on only answers to our INVITE matter
        let command = reply
            .header("CSeq")
            .and_then(|cseq| cseq.split_whitespace().last().map(SmolStr::new))
            .unwrap_or_default();
        if command != "INVITE" {
            return;
        }
        let code = reply.status_code().unwrap_or(0);

        // final answers are acknowledged, with the recorded route reversed
        if code >= 200 {
            self.calls[ci].invite_pending = false;
            if let Some(invite) = self.calls[ci].invite_request.clone() {
                let uri = self.calls[ci].remote_uri.clone();
                let recipient = self.calls[ci].remote_recipient.clone();
                let route = self.calls[ci].remote_route.clone();
                let cseq = invite.cseq_number().unwrap_or(1);
                let mut ack = self.build_request(Method::Ack, &uri, &self.calls[ci].context, cseq);
                for hop in route.iter().rev() {
                    ack.add_header("Route", hop.clone());
                }
                ack.set_header("To", recipient);
                if let Some(via) = invite.header("Via") {
                    ack.set_header("Via", via);
                }
                ack.remove_header("Contact");
                self.send_message(&ack, out);
            }
        }

        if code == 407 {
            let handled = {
                let call = &mut self.calls[ci];
                call.context.handle_authentication(&reply)
            };
            if handled {
                if let Some(invite) = self.calls[ci].invite_request.clone() {
                    let cseq = self.calls[ci].context.next_cseq();
                    let retry = self.build_retry(&invite, &self.calls[ci].context, cseq);
                    self.send_message(&retry, out);
                    let call = &mut self.calls[ci];
                    call.invite_pending = true;
                    call.invite_request = Some(retry);
                }
                return;
            }
        }

        if code == 180 {
            out.push(Action::Emit(SipClientEvent::CallRinging { call: id }));
        } else if code == 200 {
            out.push(Action::Stop(Timer::InviteTimeout(id.clone())));
            let sdp_ok = reply.header("Content-Type").as_deref() == Some("application/sdp")
                && std::str::from_utf8(&reply.body)
                    .ok()
                    .map(|body| Self::apply_sdp(&mut self.calls[ci], body))
                    .unwrap_or(false);
            if sdp_ok {
                debug!("SIP call {} established", id);
                self.set_call_state(&id, CallState::Active, out);
            } else {
                warn!("SIP call {} does not have a valid SDP descriptor", id);
                self.calls[ci].error = Some(SmolStr::new("Invalid SDP descriptor"));
                let actions = self.hangup(&id);
                out.extend(actions);
            }
        } else if code >= 300 {
            warn!("SIP call {} failed", id);
            out.push(Action::Stop(Timer::InviteTimeout(id.clone())));
            self.calls[ci].error = Some(SmolStr::new(format!(
                "{}: {}",
                code,
                reply.reason().unwrap_or("")
            )));
            self.set_call_state(&id, CallState::Finished, out);
        }
    }

    fn call_transaction_finished(
        &mut self,
        call: &CallId,
        tx: ClientTransaction,
        _response: Option<SipMessage>,
        out: &mut Vec<Action>,
    ) {
        match tx.method() {
            Some(Method::Bye) => {
                let Some(ci) = self.call_index(call) else {
                    return;
                };
                if self.calls[ci].invite_pending {
                    // the INVITE got no final answer yet, chase it with a CANCEL
                    if let Some(invite) = self.calls[ci].invite_request.clone() {
                        let uri = invite.uri().map(SmolStr::new).unwrap_or_default();
                        let cseq = invite.cseq_number().unwrap_or(1);
                        let mut request = self.build_request(
                            Method::Cancel,
                            &uri,
                            &self.calls[ci].context,
                            cseq,
                        );
                        if let Some(to) = invite.header("To") {
                            request.set_header("To", to);
                        }
                        if let Some(via) = invite.header("Via") {
                            request.set_header("Via", via);
                        }
                        request.remove_header("Contact");
                        self.start_call_transaction(ci, request, out);
                    }
                } else {
                    self.set_call_state(call, CallState::Finished, out);
                }
            }
            Some(Method::Cancel) => {
                self.set_call_state(call, CallState::Finished, out);
            }
            _ => {}
        }
        self.reap_call(call, out);
    }

    fn send_invite(&mut self, ci: usize, out: &mut Vec<Action>) {
        let sdp = Self::build_sdp(self.local_address, &self.calls[ci]);
        let uri = self.calls[ci].remote_uri.clone();
        let recipient = self.calls[ci].remote_recipient.clone();
        let cseq = self.calls[ci].context.next_cseq();
        let mut request = self.build_request(Method::Invite, &uri, &self.calls[ci].context, cseq);
        request.set_header("To", recipient);
        request.set_header("Content-Type", "application/sdp");
        request.body = Bytes::from(sdp);
        self.send_message(&request, out);

        let call = &mut self.calls[ci];
        call.invite_pending = true;
        let id = call.context.id.clone();
        call.invite_request = Some(request);
        out.push(Action::Start {
            timer: Timer::InviteTimeout(id),
            after: INVITE_TIMEOUT,
        });
    }

    fn build_sdp(local_address: IpAddr, call: &Call) -> String {
        SessionDescription::audio_offer(
            local_address,
            &call.active_time,
            call.audio.local_ssrc(),
            call.audio.local_payload_types(),
            call.media.local_user(),
            call.media.local_password(),
            call.media.local_candidates(),
        )
        .to_sdp()
    }

    /// Applies a remote session description to the call's media.
    ///
    /// Besides the advertised candidates, host candidates are synthesized
    /// from the `c=`/`m=` lines: RTP at the announced port, RTCP one above.
    fn apply_sdp(call: &mut Call, body: &str) -> bool {
        let desc = match SessionDescription::parse(body) {
            Ok(desc) => desc,
            Err(err) => {
                warn!("invalid SDP: {}", err);
                return false;
            }
        };

        if call.direction == CallDirection::Incoming {
            call.active_time = desc.active_time.clone();
        } else if desc.active_time != call.active_time {
            warn!(
                "answerer replied with a different active time {}",
                desc.active_time
            );
        }

        call.media
            .set_remote_credentials(&desc.ice_user, &desc.ice_password);
        for candidate in &desc.candidates {
            call.media.add_remote_candidate(candidate.clone());
        }
        if let Some(host) = desc.connection {
            call.media
                .add_remote_candidate(Candidate::host(RTP_COMPONENT, host, desc.audio_port));
            call.media
                .add_remote_candidate(Candidate::host(RTCP_COMPONENT, host, desc.audio_port + 1));
        }

        call.audio.set_remote_payload_types(&desc.payload_types);
        if !call.audio.is_open() {
            warn!("could not assign codec to RTP channel");
            return false;
        }
        true
    }

    // ---- timers ----

    fn handle_timer(&mut self, timer: Timer, out: &mut Vec<Action>) {
        match timer {
            Timer::ConnectRetry => self.connect_to_server(out),
            Timer::Stun => self.send_stun(out),
            Timer::Register => self.register(out),
            Timer::TransactionRetry(branch) => {
                self.transaction_timer(&branch, TransactionEvent::RetryFired, out)
            }
            Timer::TransactionTimeout(branch) => {
                self.transaction_timer(&branch, TransactionEvent::TimeoutFired, out)
            }
            Timer::InviteTimeout(call) => {
                if self.call_index(&call).is_some() {
                    warn!("SIP call {} timed out", call);
                    if let Some(ci) = self.call_index(&call) {
                        self.calls[ci].error = Some(SmolStr::new("Outgoing call timed out"));
                    }
                    self.set_call_state(&call, CallState::Finished, out);
                }
            }
            Timer::DurationTick(call) => {
                if let Some(ci) = self.call_index(&call) {
                    if self.calls[ci].state == CallState::Active {
                        self.calls[ci].duration_secs += 1;
                        out.push(Action::Emit(SipClientEvent::CallDuration {
                            call: call.clone(),
                            seconds: self.calls[ci].duration_secs,
                        }));
                        out.push(Action::Start {
                            timer: Timer::DurationTick(call),
                            after: Duration::from_secs(1),
                        });
                    }
                }
            }
        }
    }

    fn transaction_timer(&mut self, branch: &SmolStr, event: TransactionEvent, out: &mut Vec<Action>) {
        if let Some(ti) = self
            .transactions
            .iter()
            .position(|tx| tx.branch().as_ref() == Some(branch))
        {
            self.drive_client_transaction(ti, event, out);
            return;
        }
        let hit = self.calls.iter().enumerate().find_map(|(ci, call)| {
            call.transactions
                .iter()
                .position(|tx| tx.branch().as_ref() == Some(branch))
                .map(|ti| (call.context.id.clone(), ci, ti))
        });
        if let Some((id, _, ti)) = hit {
            self.drive_call_transaction(&id, ti, event, out);
        }
    }

    // ---- transaction plumbing ----

    fn start_client_transaction(&mut self, request: SipMessage, out: &mut Vec<Action>) {
        let (tx, actions) = ClientTransaction::start(request);
        let branch = tx.branch().unwrap_or_default();
        self.transactions.push(tx);
        let _ = self.route_tx_actions(&branch, actions, out);
    }

    fn start_call_transaction(&mut self, ci: usize, request: SipMessage, out: &mut Vec<Action>) {
        let (tx, actions) = ClientTransaction::start(request);
        let branch = tx.branch().unwrap_or_default();
        self.calls[ci].transactions.push(tx);
        let _ = self.route_tx_actions(&branch, actions, out);
    }

    fn drive_client_transaction(
        &mut self,
        ti: usize,
        event: TransactionEvent,
        out: &mut Vec<Action>,
    ) {
        let branch = self.transactions[ti].branch().unwrap_or_default();
        let actions = self.transactions[ti].on_event(event);
        if let Some(response) = self.route_tx_actions(&branch, actions, out) {
            let tx = self.transactions.remove(ti);
            self.client_transaction_finished(tx, response, out);
        }
    }

    fn drive_call_transaction(
        &mut self,
        call: &CallId,
        ti: usize,
        event: TransactionEvent,
        out: &mut Vec<Action>,
    ) {
        let Some(ci) = self.call_index(call) else {
            return;
        };
        let branch = self.calls[ci].transactions[ti].branch().unwrap_or_default();
        let actions = self.calls[ci].transactions[ti].on_event(event);
        if let Some(response) = self.route_tx_actions(&branch, actions, out) {
            let tx = self.calls[ci].transactions.remove(ti);
            self.call_transaction_finished(call, tx, response, out);
        }
    }

    /// Translates transaction actions into engine actions; a terminal
    /// outcome is returned to the caller instead of being acted on.
    fn route_tx_actions(
        &mut self,
        branch: &SmolStr,
        actions: Vec<TransactionAction>,
        out: &mut Vec<Action>,
    ) -> Option<Option<SipMessage>> {
        let mut finished = None;
        for action in actions {
            match action {
                TransactionAction::Transmit(payload) => self.send(payload, out),
                TransactionAction::ScheduleRetry(after) => out.push(Action::Start {
                    timer: Timer::TransactionRetry(branch.clone()),
                    after,
                }),
                TransactionAction::ScheduleTimeout(after) => out.push(Action::Start {
                    timer: Timer::TransactionTimeout(branch.clone()),
                    after,
                }),
                TransactionAction::CancelTimers => {
                    out.push(Action::Stop(Timer::TransactionRetry(branch.clone())));
                    out.push(Action::Stop(Timer::TransactionTimeout(branch.clone())));
                }
                TransactionAction::Finished(response) => finished = Some(response),
            }
        }
        finished
    }

    // ---- message construction ----

    fn credentials(&self) -> DigestCredentials {
        DigestCredentials {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        }
    }

    fn local_host(&self) -> String {
        SocketAddr::new(self.local_address, self.local_port).to_string()
    }

    fn set_contact(&self, message: &mut SipMessage) {
        message.set_header(
            "Contact",
            format!("<sip:{}@{}>", self.config.username, self.local_host()),
        );
    }

    fn build_request(
        &self,
        method: Method,
        uri: &str,
        ctx: &CallContext,
        cseq: u32,
    ) -> SipMessage {
        let mut addr = String::new();
        if !self.config.display_name.is_empty() {
            addr.push_str(&format!("\"{}\"", self.config.display_name));
        }
        addr.push_str(&format!(
            "<sip:{}@{}>",
            self.config.username, self.config.domain
        ));

        let via = format!(
            "SIP/2.0/UDP {};branch={};rport",
            self.local_host(),
            generate_branch()
        );

        let mut packet = SipMessage::request(method.clone(), uri);
        packet.set_header("Via", via);
        packet.set_header("Max-Forwards", "70");
        packet.set_header("Call-ID", ctx.id.clone());
        packet.set_header("CSeq", format!("{} {}", cseq, method.as_str()));
        self.set_contact(&mut packet);
        packet.set_header("To", addr.clone());
        packet.set_header("From", format!("{};tag={}", addr, ctx.tag));

        if let Some(challenge) = &ctx.challenge {
            packet.set_header(
                "Authorization",
                self.credentials()
                    .authorization(method.as_str(), uri, challenge),
            );
        }
        if let Some(challenge) = &ctx.proxy_challenge {
            packet.set_header(
                "Proxy-Authorization",
                self.credentials()
                    .authorization(method.as_str(), uri, challenge),
            );
        }

        packet.set_header("User-Agent", self.config.user_agent.clone());
        if !matches!(method, Method::Ack | Method::Cancel) {
            packet.set_header("Allow", ALLOW_METHODS);
        }
        packet
    }

    fn build_response(&self, request: &SipMessage, code: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::response(code, reason);
        for via in request.header_values("Via") {
            response.add_header("Via", via);
        }
        response.set_header("From", request.header("From").unwrap_or_default());
        response.set_header("To", request.header("To").unwrap_or_default());
        response.set_header("Call-ID", request.header("Call-ID").unwrap_or_default());
        response.set_header("CSeq", request.header("CSeq").unwrap_or_default());
        for route in request.header_values("Record-Route") {
            response.add_header("Record-Route", route);
        }
        self.set_contact(&mut response);
        response.set_header("User-Agent", self.config.user_agent.clone());
        response
    }

    /// Rebuilds a challenged request with the next CSeq and fresh
    /// authorization headers; the Via branch is kept.
    fn build_retry(&self, original: &SipMessage, ctx: &CallContext, cseq: u32) -> SipMessage {
        let mut request = original.clone();
        let method = request
            .method()
            .cloned()
            .unwrap_or(Method::Unknown(SmolStr::default()));
        let uri = request.uri().map(SmolStr::new).unwrap_or_default();

        request.set_header("CSeq", format!("{} {}", cseq, method.as_str()));
        if let Some(challenge) = &ctx.challenge {
            request.set_header(
                "Authorization",
                self.credentials()
                    .authorization(method.as_str(), &uri, challenge),
            );
        }
        if let Some(challenge) = &ctx.proxy_challenge {
            request.set_header(
                "Proxy-Authorization",
                self.credentials()
                    .authorization(method.as_str(), &uri, challenge),
            );
        }
        self.set_contact(&mut request);
        request
    }

    // ---- plumbing ----

    fn call_index(&self, id: &str) -> Option<usize> {
        self.calls.iter().position(|call| call.context.id == id)
    }

    fn send(&self, payload: Bytes, out: &mut Vec<Action>) {
        match self.server {
            Some(to) => out.push(Action::Send { payload, to }),
            None => warn!("no SIP server address, dropping outgoing message"),
        }
    }

    fn send_message(&self, message: &SipMessage, out: &mut Vec<Action>) {
        self.send(message.to_bytes(), out);
    }

    fn set_state(&mut self, state: ClientState, out: &mut Vec<Action>) {
        if self.state != state {
            self.state = state;
            out.push(Action::Emit(SipClientEvent::ClientStateChanged(state)));
        }
    }

    fn set_call_state(&mut self, call: &CallId, state: CallState, out: &mut Vec<Action>) {
        let Some(ci) = self.call_index(call) else {
            return;
        };
        if self.calls[ci].state == state {
            return;
        }
        self.calls[ci].state = state;
        let error = self.calls[ci].error.clone();
        out.push(Action::Emit(SipClientEvent::CallStateChanged {
            call: call.clone(),
            state,
            error,
        }));

        match state {
            CallState::Active => {
                self.calls[ci].duration_secs = 0;
                out.push(Action::Start {
                    timer: Timer::DurationTick(call.clone()),
                    after: Duration::from_secs(1),
                });
            }
            CallState::Finished => {
                debug!("SIP call {} finished", call);
                out.push(Action::Stop(Timer::DurationTick(call.clone())));
                out.push(Action::Stop(Timer::InviteTimeout(call.clone())));
                out.push(Action::Emit(SipClientEvent::CallDuration {
                    call: call.clone(),
                    seconds: self.calls[ci].duration_secs,
                }));
                self.reap_call(call, out);
            }
            _ => {}
        }
    }

    fn reap_call(&mut self, call: &CallId, out: &mut Vec<Action>) {
        if let Some(ci) = self.call_index(call) {
            if self.calls[ci].state == CallState::Finished
                && self.calls[ci].transactions.is_empty()
            {
                self.calls.remove(ci);
                out.push(Action::Emit(SipClientEvent::ActiveCallsChanged(
                    self.calls.len(),
                )));
            }
        }
    }
}

/// Extracts the SIP URI from an address like `"Bob" <sip:bob@host>;tag=x`,
/// accepting a bare `sip:` URI as well.
pub fn sip_address_to_uri(address: &str) -> Option<SmolStr> {
    if let Some(start) = address.find('<') {
        let rest = &address[start + 1..];
        let end = rest.find('>')?;
        let uri = &rest[..end];
        return uri.starts_with("sip:").then(|| SmolStr::new(uri));
    }
    let trimmed = address.trim();
    trimmed.starts_with("sip:").then(|| SmolStr::new(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StaticMediaFactory;

    fn engine() -> ClientEngine {
        let factory = StaticMediaFactory::new("10.0.0.1".parse().unwrap(), 40000);
        ClientEngine::new(
            ClientConfig::new("alice", "secret", "example.com"),
            Box::new(factory),
            "10.0.0.1".parse().unwrap(),
            5060,
        )
    }

    #[test]
    fn config_carries_an_overridable_route_probe() {
        let mut config = ClientConfig::new("alice", "secret", "example.com");
        assert_eq!(config.probe_address.to_string(), "8.8.8.8:53");
        config.probe_address = "10.0.0.254:53".parse().unwrap();
        assert_eq!(config.probe_address.port(), 53);
    }

    #[test]
    fn extracts_uri_from_addresses() {
        assert_eq!(
            sip_address_to_uri("\"Bob\" <sip:bob@example.com>;tag=x").unwrap(),
            "sip:bob@example.com"
        );
        assert_eq!(
            sip_address_to_uri("sip:carol@example.com").unwrap(),
            "sip:carol@example.com"
        );
        assert!(sip_address_to_uri("<mailto:bob@example.com>").is_none());
        assert!(sip_address_to_uri("just a name").is_none());
    }

    #[test]
    fn requests_carry_identity_and_routing_headers() {
        let engine = engine();
        let ctx = CallContext::new();
        let request = engine.build_request(Method::Register, "sip:example.com", &ctx, 1);

        let via = request.header("Via").unwrap();
        assert!(via.starts_with("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-"));
        assert!(via.ends_with(";rport"));
        assert_eq!(request.header("Max-Forwards").unwrap(), "70");
        assert_eq!(request.header("Call-ID").unwrap(), ctx.id);
        assert_eq!(request.header("CSeq").unwrap(), "1 REGISTER");
        assert_eq!(
            request.header("Contact").unwrap(),
            "<sip:alice@10.0.0.1:5060>"
        );
        assert_eq!(request.header("To").unwrap(), "<sip:alice@example.com>");
        assert_eq!(
            request.header("From").unwrap(),
            format!("<sip:alice@example.com>;tag={}", ctx.tag)
        );
        assert_eq!(request.header("Allow").unwrap(), ALLOW_METHODS);
        assert!(request.header("Authorization").is_none());
    }

    #[test]
    fn ack_and_cancel_do_not_advertise_allow() {
        let engine = engine();
        let ctx = CallContext::new();
        let ack = engine.build_request(Method::Ack, "sip:b@h", &ctx, 2);
        assert!(ack.header("Allow").is_none());
        let cancel = engine.build_request(Method::Cancel, "sip:b@h", &ctx, 2);
        assert!(cancel.header("Allow").is_none());
    }

    #[test]
    fn responses_mirror_the_request_dialog_headers() {
        let engine = engine();
        let raw = b"INVITE sip:alice@10.0.0.1 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK-in1\r\n\
            Record-Route: <sip:proxy1.example.com;lr>\r\n\
            Record-Route: <sip:proxy2.example.com;lr>\r\n\
            From: <sip:bob@example.com>;tag=b1\r\n\
            To: <sip:alice@example.com>\r\n\
            Call-ID: in-1\r\n\
            CSeq: 1 INVITE\r\n\r\n";
        let request = SipMessage::parse(raw).unwrap();
        let response = engine.build_response(&request, 180, "Ringing");

        assert_eq!(response.status_code(), Some(180));
        assert_eq!(
            response.header("Via").unwrap(),
            "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK-in1"
        );
        let routes: Vec<_> = response.header_values("Record-Route");
        assert_eq!(routes.len(), 2);
        assert_eq!(response.header("CSeq").unwrap(), "1 INVITE");
        assert_eq!(
            response.header("Contact").unwrap(),
            "<sip:alice@10.0.0.1:5060>"
        );
    }

    #[test]
    fn retry_keeps_branch_but_advances_cseq_and_auth() {
        let engine = engine();
        let mut ctx = CallContext::new();
        let original = engine.build_request(Method::Register, "sip:example.com", &ctx, 1);

        let mut challenge_response = SipMessage::response(401, "Unauthorized");
        challenge_response.add_header(
            "WWW-Authenticate",
            "Digest realm=\"example.com\", nonce=\"n1\"",
        );
        assert!(ctx.handle_authentication(&challenge_response));

        let retry = engine.build_retry(&original, &ctx, 2);
        assert_eq!(retry.header("CSeq").unwrap(), "2 REGISTER");
        assert_eq!(retry.header("Via"), original.header("Via"));
        let auth = retry.header("Authorization").unwrap();
        assert!(auth.starts_with("Digest "));
        assert!(auth.contains("realm=\"example.com\""));
    }
}
