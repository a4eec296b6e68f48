// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end engine tests: every stimulus is an `Input`, every assertion
//! runs against the returned actions, no sockets or clocks involved.

use std::sync::Arc;
use std::time::Duration;

use smol_str::SmolStr;
use softsip_agent::{
    Action, CallId, CallState, ClientConfig, ClientEngine, ClientState, Input, MediaFactory,
    Service, SipClientEvent, StaticMediaFactory, Timer,
};
use softsip_core::SipMessage;
use softsip_stun::{StunAttribute, StunMessage, StunMessageType};

const SIP_SERVER: &str = "192.0.2.20:5060";
const STUN_SERVER: &str = "192.0.2.30:3478";

/// Lets tests keep a handle on the factory after the engine takes it.
struct SharedFactory(Arc<StaticMediaFactory>);

impl MediaFactory for SharedFactory {
    fn create(
        &self,
        controlling: bool,
    ) -> (
        Box<dyn softsip_agent::MediaSession>,
        Box<dyn softsip_agent::AudioChannel>,
    ) {
        self.0.create(controlling)
    }
}

fn new_engine() -> (ClientEngine, Arc<StaticMediaFactory>) {
    let factory = Arc::new(StaticMediaFactory::new("10.0.0.1".parse().unwrap(), 40000));
    let engine = ClientEngine::new(
        ClientConfig::new("alice", "secret", "example.com"),
        Box::new(SharedFactory(factory.clone())),
        "10.0.0.1".parse().unwrap(),
        5060,
    );
    (engine, factory)
}

fn sent_messages(actions: &[Action]) -> Vec<SipMessage> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Send { payload, .. } => SipMessage::parse(payload),
            _ => None,
        })
        .collect()
}

fn emitted(actions: &[Action]) -> Vec<SipClientEvent> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Emit(event) => Some(event.clone()),
            _ => None,
        })
        .collect()
}

fn started(actions: &[Action], timer: &Timer) -> Option<Duration> {
    actions.iter().find_map(|action| match action {
        Action::Start { timer: t, after } if t == timer => Some(*after),
        _ => None,
    })
}

fn from_server(engine: &mut ClientEngine, message: &SipMessage) -> Vec<Action> {
    engine.handle(Input::Datagram {
        payload: message.to_bytes(),
        source: SIP_SERVER.parse().unwrap(),
    })
}

fn reply_to(request: &SipMessage, code: u16, reason: &str) -> SipMessage {
    let mut response = SipMessage::response(code, reason);
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = request.header(name) {
            response.set_header(name, value);
        }
    }
    response
}

/// Walks an engine through discovery, STUN, and registration.
fn connect(engine: &mut ClientEngine) {
    let actions = engine.connect();
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::ResolveSrv { service: Service::Sip, .. })));
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::ResolveSrv { service: Service::Stun, .. })));

    engine.handle(Input::SrvResolved {
        service: Service::Stun,
        targets: vec![(SmolStr::new("stun.example.com"), 3478)],
    });
    let actions = engine.handle(Input::HostResolved {
        service: Service::Stun,
        address: Some("192.0.2.30".parse().unwrap()),
    });
    let stun_request = actions
        .iter()
        .find_map(|a| match a {
            Action::Send { payload, to } if to.to_string() == STUN_SERVER => {
                StunMessage::from_bytes(payload).ok()
            }
            _ => None,
        })
        .expect("a STUN binding request goes out");

    let stun_response = StunMessage {
        message_type: StunMessageType::BindingResponse,
        transaction_id: stun_request.transaction_id,
        attributes: vec![StunAttribute::XorMappedAddress(
            "203.0.113.1:5060".parse().unwrap(),
        )],
    };
    let actions = engine.handle(Input::Datagram {
        payload: stun_response.to_bytes(),
        source: STUN_SERVER.parse().unwrap(),
    });
    assert!(actions.contains(&Action::RefreshLocalAddress));
    assert_eq!(
        started(&actions, &Timer::Stun),
        Some(Duration::from_secs(30))
    );
    engine.handle(Input::LocalAddressRefreshed("10.0.0.1".parse().unwrap()));

    engine.handle(Input::SrvResolved {
        service: Service::Sip,
        targets: vec![(SmolStr::new("sip.example.com"), 5060)],
    });
    let actions = engine.handle(Input::HostResolved {
        service: Service::Sip,
        address: Some("192.0.2.20".parse().unwrap()),
    });
    assert_eq!(engine.client_state(), ClientState::Connecting);

    let register = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("REGISTER"))
        .expect("a REGISTER goes out");
    assert_eq!(register.uri(), Some("sip:example.com"));
    assert_eq!(register.header("Expires").unwrap(), "120");

    let mut ok = reply_to(&register, 200, "OK");
    let contact = register.header("Contact").unwrap();
    ok.set_header("Contact", format!("{};expires=3600", contact));
    let actions = from_server(engine, &ok);
    assert!(actions.contains(&Action::Stop(Timer::ConnectRetry)));
    assert!(emitted(&actions)
        .contains(&SipClientEvent::ClientStateChanged(ClientState::Connected)));
    assert_eq!(
        started(&actions, &Timer::Register),
        Some(Duration::from_secs(3590))
    );
}

fn connected_engine() -> (ClientEngine, Arc<StaticMediaFactory>) {
    let (mut engine, factory) = new_engine();
    connect(&mut engine);
    (engine, factory)
}

/// Dials and returns the call id plus the INVITE that went out.
fn dial(engine: &mut ClientEngine) -> (CallId, SipMessage) {
    let (id, actions) = engine.call("sip:bob@example.com");
    let id = id.expect("call is created");
    assert!(emitted(&actions).contains(&SipClientEvent::ActiveCallsChanged(1)));
    assert_eq!(
        started(&actions, &Timer::InviteTimeout(id.clone())),
        Some(Duration::from_millis(32_000))
    );

    let invite = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("INVITE"))
        .expect("an INVITE goes out");
    assert_eq!(invite.header("To").unwrap(), "sip:bob@example.com");
    assert_eq!(invite.header("Content-Type").unwrap(), "application/sdp");
    (id, invite)
}

fn sdp_answer() -> String {
    concat!(
        "v=0\r\n",
        "o=- 1 1 IN IP4 192.0.2.40\r\n",
        "s=-\r\n",
        "t=0 0\r\n",
        "m=audio 50000 RTP/AVP 0\r\n",
        "c=IN IP4 192.0.2.40\r\n",
        "a=ice-ufrag:remo\r\n",
        "a=ice-pwd:remotepasswordremotepass\r\n",
    )
    .to_string()
}

#[test]
fn registers_after_discovery() {
    let (mut engine, _) = new_engine();
    connect(&mut engine);
    assert_eq!(engine.client_state(), ClientState::Connected);
}

#[test]
fn missing_srv_records_fall_back_to_conventional_names() {
    let (mut engine, _) = new_engine();
    engine.connect();
    let actions = engine.handle(Input::SrvResolved {
        service: Service::Sip,
        targets: Vec::new(),
    });
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::ResolveHost { service: Service::Sip, name } if name == "sip.example.com"
    )));
    let actions = engine.handle(Input::SrvResolved {
        service: Service::Stun,
        targets: Vec::new(),
    });
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::ResolveHost { service: Service::Stun, name } if name == "stun.example.com"
    )));
}

#[test]
fn challenged_register_is_retried_with_credentials() {
    let (mut engine, _) = new_engine();
    let actions = engine.connect();
    assert!(!actions.is_empty());
    engine.handle(Input::SrvResolved {
        service: Service::Stun,
        targets: vec![(SmolStr::new("stun.example.com"), 3478)],
    });
    let actions = engine.handle(Input::HostResolved {
        service: Service::Stun,
        address: Some("192.0.2.30".parse().unwrap()),
    });
    let stun_request = actions
        .iter()
        .find_map(|a| match a {
            Action::Send { payload, .. } => StunMessage::from_bytes(payload).ok(),
            _ => None,
        })
        .unwrap();
    let stun_response = StunMessage {
        message_type: StunMessageType::BindingResponse,
        transaction_id: stun_request.transaction_id,
        attributes: vec![StunAttribute::XorMappedAddress(
            "203.0.113.1:5060".parse().unwrap(),
        )],
    };
    engine.handle(Input::Datagram {
        payload: stun_response.to_bytes(),
        source: STUN_SERVER.parse().unwrap(),
    });
    engine.handle(Input::LocalAddressRefreshed("10.0.0.1".parse().unwrap()));
    engine.handle(Input::SrvResolved {
        service: Service::Sip,
        targets: vec![(SmolStr::new("sip.example.com"), 5060)],
    });
    let actions = engine.handle(Input::HostResolved {
        service: Service::Sip,
        address: Some("192.0.2.20".parse().unwrap()),
    });
    let register = sent_messages(&actions).pop().unwrap();
    assert!(register.header("Authorization").is_none());

    let mut challenge = reply_to(&register, 401, "Unauthorized");
    challenge.set_header(
        "WWW-Authenticate",
        "Digest realm=\"example.com\", nonce=\"n1\"",
    );
    let actions = from_server(&mut engine, &challenge);
    let retry = sent_messages(&actions).pop().expect("REGISTER is retried");
    assert_eq!(retry.header("CSeq").unwrap(), "2 REGISTER");
    let auth = retry.header("Authorization").unwrap();
    assert!(auth.contains("username=\"alice\""));
    assert!(auth.contains("nonce=\"n1\""));

    // the same challenge again means the credentials were rejected
    let mut challenge = reply_to(&retry, 401, "Unauthorized");
    challenge.set_header(
        "WWW-Authenticate",
        "Digest realm=\"example.com\", nonce=\"n1\"",
    );
    let actions = from_server(&mut engine, &challenge);
    assert!(emitted(&actions).contains(&SipClientEvent::ClientStateChanged(
        ClientState::Disconnected
    )));
    assert_eq!(
        started(&actions, &Timer::ConnectRetry),
        Some(Duration::from_secs(60))
    );
}

#[test]
fn outgoing_call_rings_and_goes_active() {
    let (mut engine, factory) = connected_engine();
    let (id, invite) = dial(&mut engine);
    assert!(std::str::from_utf8(&invite.body)
        .unwrap()
        .contains("m=audio 40000 RTP/AVP 0 8"));

    let ringing = reply_to(&invite, 180, "Ringing");
    let actions = from_server(&mut engine, &ringing);
    assert!(emitted(&actions).contains(&SipClientEvent::CallRinging { call: id.clone() }));

    let mut ok = reply_to(&invite, 200, "OK");
    ok.set_header("To", "<sip:bob@example.com>;tag=b2");
    ok.add_header("Record-Route", "<sip:proxy1.example.com;lr>");
    ok.add_header("Record-Route", "<sip:proxy2.example.com;lr>");
    ok.set_header("Contact", "<sip:bob@192.0.2.40:5060>");
    ok.set_header("Content-Type", "application/sdp");
    ok.body = sdp_answer().into();
    let actions = from_server(&mut engine, &ok);

    assert!(actions.contains(&Action::Stop(Timer::InviteTimeout(id.clone()))));
    let ack = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("ACK"))
        .expect("the final answer is acknowledged");
    assert_eq!(ack.header("CSeq").unwrap(), "1 ACK");
    assert_eq!(ack.uri(), Some("sip:bob@192.0.2.40:5060"));
    assert_eq!(ack.header("Via"), invite.header("Via"));
    assert!(ack.header("Contact").is_none());
    // the recorded route is walked backwards
    let routes = ack.header_values("Route");
    assert_eq!(routes[0], "<sip:proxy2.example.com;lr>");
    assert_eq!(routes[1], "<sip:proxy1.example.com;lr>");

    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id.clone(),
        state: CallState::Active,
        error: None,
    }));
    assert_eq!(
        started(&actions, &Timer::DurationTick(id.clone())),
        Some(Duration::from_secs(1))
    );

    // remote candidates: advertised ones plus hosts derived from c=/m=
    let session = &factory.sessions()[0];
    let remotes = session.remote_candidates();
    assert!(remotes
        .iter()
        .any(|c| c.port == 50000 && c.host.to_string() == "192.0.2.40"));
    assert!(remotes.iter().any(|c| c.port == 50001));
    assert_eq!(session.remote_user(), "remo");

    // duration ticks re-arm themselves
    let actions = engine.handle(Input::Timer(Timer::DurationTick(id.clone())));
    assert!(emitted(&actions).contains(&SipClientEvent::CallDuration {
        call: id.clone(),
        seconds: 1,
    }));
    assert_eq!(
        started(&actions, &Timer::DurationTick(id)),
        Some(Duration::from_secs(1))
    );
}

#[test]
fn queued_invite_waits_for_gathering_to_complete() {
    use std::sync::Mutex;

    let factory = Arc::new(
        StaticMediaFactory::new("10.0.0.1".parse().unwrap(), 40000).defer_gathering(),
    );
    let mut engine = ClientEngine::new(
        ClientConfig::new("alice", "secret", "example.com"),
        Box::new(SharedFactory(factory.clone())),
        "10.0.0.1".parse().unwrap(),
        5060,
    );
    let reported: Arc<Mutex<Vec<CallId>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_log = reported.clone();
    engine.set_gathering_sink(Arc::new(move |call| {
        sink_log.lock().unwrap().push(call);
    }));
    connect(&mut engine);

    // gathering is still running, so the INVITE stays queued
    let (id, actions) = engine.call("sip:bob@example.com");
    let id = id.expect("call is created");
    assert!(sent_messages(&actions).is_empty());
    assert_eq!(started(&actions, &Timer::InviteTimeout(id.clone())), None);

    // the session finishing gathering reaches the engine through the sink
    factory.sessions()[0].finish_gathering();
    assert_eq!(reported.lock().unwrap().as_slice(), &[id.clone()]);

    let actions = engine.handle(Input::GatheringComplete { call: id.clone() });
    let invite = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("INVITE"))
        .expect("the queued INVITE goes out");
    assert_eq!(invite.header("To").unwrap(), "sip:bob@example.com");
    assert_eq!(
        started(&actions, &Timer::InviteTimeout(id.clone())),
        Some(Duration::from_millis(32_000))
    );

    // a duplicate completion signal does not resend
    let actions = engine.handle(Input::GatheringComplete { call: id });
    assert!(sent_messages(&actions).is_empty());
}

#[test]
fn rejected_call_reports_code_and_reason() {
    let (mut engine, _) = connected_engine();
    let (id, invite) = dial(&mut engine);

    let busy = reply_to(&invite, 486, "Busy Here");
    let actions = from_server(&mut engine, &busy);
    assert!(sent_messages(&actions)
        .iter()
        .any(|m| m.header("CSeq").unwrap().ends_with("ACK")));
    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id,
        state: CallState::Finished,
        error: Some(SmolStr::new("486: Busy Here")),
    }));
    assert!(emitted(&actions).contains(&SipClientEvent::ActiveCallsChanged(0)));
}

#[test]
fn unanswered_invite_times_out() {
    let (mut engine, _) = connected_engine();
    let (id, _) = dial(&mut engine);

    let actions = engine.handle(Input::Timer(Timer::InviteTimeout(id.clone())));
    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id,
        state: CallState::Finished,
        error: Some(SmolStr::new("Outgoing call timed out")),
    }));
}

#[test]
fn invalid_answer_sdp_hangs_up() {
    let (mut engine, _) = connected_engine();
    let (id, invite) = dial(&mut engine);

    let mut ok = reply_to(&invite, 200, "OK");
    ok.set_header("Content-Type", "application/sdp");
    ok.body = "v=0\r\no=- 1 1 IN IP4 192.0.2.40\r\ns=-\r\n".into();
    let actions = from_server(&mut engine, &ok);

    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id,
        state: CallState::Disconnecting,
        error: Some(SmolStr::new("Invalid SDP descriptor")),
    }));
    assert!(sent_messages(&actions)
        .iter()
        .any(|m| m.header("CSeq").unwrap().ends_with("BYE")));
}

#[test]
fn hangup_sends_bye_once_and_finishes_on_ok() {
    let (mut engine, factory) = connected_engine();
    let (id, invite) = dial(&mut engine);

    let mut ok = reply_to(&invite, 200, "OK");
    ok.set_header("To", "<sip:bob@example.com>;tag=b2");
    ok.set_header("Content-Type", "application/sdp");
    ok.body = sdp_answer().into();
    from_server(&mut engine, &ok);

    let actions = engine.hangup(&id);
    let bye = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("BYE"))
        .expect("a BYE goes out");
    assert_eq!(bye.header("CSeq").unwrap(), "2 BYE");
    assert!(factory.sessions()[0].is_closed());

    // hanging up again does nothing
    assert!(engine.hangup(&id).is_empty());

    let bye_ok = reply_to(&bye, 200, "OK");
    let actions = from_server(&mut engine, &bye_ok);
    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id,
        state: CallState::Finished,
        error: None,
    }));
    assert!(emitted(&actions).contains(&SipClientEvent::ActiveCallsChanged(0)));
    assert_eq!(engine.active_calls(), 0);
}

#[test]
fn hangup_before_an_answer_chases_with_cancel() {
    let (mut engine, _) = connected_engine();
    let (id, invite) = dial(&mut engine);

    let actions = engine.hangup(&id);
    assert!(actions.contains(&Action::Stop(Timer::InviteTimeout(id.clone()))));
    let bye = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("BYE"))
        .unwrap();

    let bye_ok = reply_to(&bye, 200, "OK");
    let actions = from_server(&mut engine, &bye_ok);
    let cancel = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("CANCEL"))
        .expect("the unanswered INVITE is cancelled");
    assert_eq!(cancel.header("CSeq").unwrap(), "1 CANCEL");
    assert_eq!(cancel.header("Via"), invite.header("Via"));
    assert_eq!(cancel.header("To"), invite.header("To"));
    assert!(cancel.header("Contact").is_none());

    let cancel_ok = reply_to(&cancel, 200, "OK");
    let actions = from_server(&mut engine, &cancel_ok);
    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id,
        state: CallState::Finished,
        error: None,
    }));
    assert_eq!(engine.active_calls(), 0);
}

fn incoming_invite() -> SipMessage {
    let raw = concat!(
        "INVITE sip:alice@10.0.0.1:5060 SIP/2.0\r\n",
        "Via: SIP/2.0/UDP 192.0.2.40:5060;branch=z9hG4bK-remote1\r\n",
        "From: \"Bob\" <sip:bob@example.com>;tag=b1\r\n",
        "To: <sip:alice@example.com>\r\n",
        "Call-ID: remote-call-1\r\n",
        "CSeq: 1 INVITE\r\n",
        "Contact: <sip:bob@192.0.2.40:5060>\r\n",
        "Content-Type: application/sdp\r\n",
        "\r\n",
        "v=0\r\n",
        "o=- 1 1 IN IP4 192.0.2.40\r\n",
        "s=-\r\n",
        "t=0 0\r\n",
        "m=audio 50000 RTP/AVP 0\r\n",
        "c=IN IP4 192.0.2.40\r\n",
    );
    SipMessage::parse(raw.as_bytes()).unwrap()
}

#[test]
fn incoming_call_rings_accepts_and_finishes() {
    let (mut engine, factory) = connected_engine();
    let actions = from_server(&mut engine, &incoming_invite());

    let events = emitted(&actions);
    assert!(events.contains(&SipClientEvent::ActiveCallsChanged(1)));
    let id: CallId = SmolStr::new("remote-call-1");
    assert!(events.contains(&SipClientEvent::CallReceived {
        call: id.clone(),
        from: SmolStr::new("\"Bob\" <sip:bob@example.com>;tag=b1"),
    }));

    let ringing = sent_messages(&actions).pop().expect("180 goes out");
    assert_eq!(ringing.status_code(), Some(180));
    // we picked a local tag for the dialog
    assert!(ringing.header("To").unwrap().contains(";tag="));

    // host candidates synthesized from the offer's c=/m= lines
    let remotes = factory.sessions()[0].remote_candidates();
    assert!(remotes.iter().any(|c| c.port == 50000));
    assert!(remotes.iter().any(|c| c.port == 50001));

    let actions = engine.accept(&id);
    let ok = sent_messages(&actions).pop().expect("200 goes out");
    assert_eq!(ok.status_code(), Some(200));
    assert_eq!(ok.header("Content-Type").unwrap(), "application/sdp");
    assert_eq!(ok.header("Supported").unwrap(), "replaces");
    assert!(std::str::from_utf8(&ok.body)
        .unwrap()
        .contains("m=audio 40000 RTP/AVP 0 8"));

    let ack = SipMessage::parse(
        concat!(
            "ACK sip:alice@10.0.0.1:5060 SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 192.0.2.40:5060;branch=z9hG4bK-remote2\r\n",
            "From: \"Bob\" <sip:bob@example.com>;tag=b1\r\n",
            "To: <sip:alice@example.com>\r\n",
            "Call-ID: remote-call-1\r\n",
            "CSeq: 1 ACK\r\n",
            "\r\n",
        )
        .as_bytes(),
    )
    .unwrap();
    let actions = from_server(&mut engine, &ack);
    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id.clone(),
        state: CallState::Active,
        error: None,
    }));

    let bye = SipMessage::parse(
        concat!(
            "BYE sip:alice@10.0.0.1:5060 SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 192.0.2.40:5060;branch=z9hG4bK-remote3\r\n",
            "From: \"Bob\" <sip:bob@example.com>;tag=b1\r\n",
            "To: <sip:alice@example.com>\r\n",
            "Call-ID: remote-call-1\r\n",
            "CSeq: 2 BYE\r\n",
            "\r\n",
        )
        .as_bytes(),
    )
    .unwrap();
    let actions = from_server(&mut engine, &bye);
    let ok = sent_messages(&actions).pop().expect("BYE is answered");
    assert_eq!(ok.status_code(), Some(200));
    assert_eq!(ok.header("CSeq").unwrap(), "2 BYE");
    assert!(emitted(&actions).contains(&SipClientEvent::CallStateChanged {
        call: id,
        state: CallState::Finished,
        error: None,
    }));
    assert_eq!(engine.active_calls(), 0);
}

#[test]
fn invite_without_usable_sdp_is_rejected() {
    let (mut engine, _) = connected_engine();
    let raw = concat!(
        "INVITE sip:alice@10.0.0.1:5060 SIP/2.0\r\n",
        "Via: SIP/2.0/UDP 192.0.2.40:5060;branch=z9hG4bK-remote1\r\n",
        "From: <sip:bob@example.com>;tag=b1\r\n",
        "To: <sip:alice@example.com>\r\n",
        "Call-ID: remote-call-2\r\n",
        "CSeq: 1 INVITE\r\n",
        "Content-Type: application/sdp\r\n",
        "\r\n",
        "v=0\r\n",
        "s=-\r\n",
    );
    let invite = SipMessage::parse(raw.as_bytes()).unwrap();
    let actions = from_server(&mut engine, &invite);
    let response = sent_messages(&actions).pop().unwrap();
    assert_eq!(response.status_code(), Some(400));
}

#[test]
fn unknown_in_dialog_method_gets_405() {
    let (mut engine, _) = connected_engine();
    from_server(&mut engine, &incoming_invite());

    let options = SipMessage::parse(
        concat!(
            "OPTIONS sip:alice@10.0.0.1:5060 SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 192.0.2.40:5060;branch=z9hG4bK-remote9\r\n",
            "From: \"Bob\" <sip:bob@example.com>;tag=b1\r\n",
            "To: <sip:alice@example.com>\r\n",
            "Call-ID: remote-call-1\r\n",
            "CSeq: 3 OPTIONS\r\n",
            "\r\n",
        )
        .as_bytes(),
    )
    .unwrap();
    let actions = from_server(&mut engine, &options);
    let response = sent_messages(&actions).pop().unwrap();
    assert_eq!(response.status_code(), Some(405));
}

#[test]
fn disconnect_unregisters_and_reports_disconnected() {
    let (mut engine, _) = connected_engine();
    let actions = engine.disconnect();
    assert_eq!(engine.client_state(), ClientState::Disconnecting);

    let unregister = sent_messages(&actions)
        .into_iter()
        .find(|m| m.header("CSeq").unwrap().ends_with("REGISTER"))
        .expect("an un-REGISTER goes out");
    assert!(unregister
        .header("Contact")
        .unwrap()
        .ends_with(";expires=0"));

    let ok = reply_to(&unregister, 200, "OK");
    let actions = from_server(&mut engine, &ok);
    assert!(emitted(&actions).contains(&SipClientEvent::ClientStateChanged(
        ClientState::Disconnected
    )));
}

#[test]
fn calls_require_a_registered_client() {
    let (mut engine, _) = new_engine();
    let (id, actions) = engine.call("sip:bob@example.com");
    assert!(id.is_none());
    assert!(actions.is_empty());
}

#[test]
fn stun_keepalive_resends_binding_requests() {
    let (mut engine, _) = connected_engine();
    let actions = engine.handle(Input::Timer(Timer::Stun));
    let request = actions
        .iter()
        .find_map(|a| match a {
            Action::Send { payload, to } => {
                assert_eq!(to.to_string(), STUN_SERVER);
                StunMessage::from_bytes(payload).ok()
            }
            _ => None,
        })
        .expect("a binding request goes out");
    assert_eq!(request.message_type, StunMessageType::BindingRequest);
    assert_eq!(
        started(&actions, &Timer::Stun),
        Some(Duration::from_millis(500))
    );
}
