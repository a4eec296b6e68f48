use std::time::Duration;

use bytes::Bytes;
use smol_str::SmolStr;
use softsip_core::{Method, SipMessage};

use crate::{branch_from_via, TransactionState, T1, T2, TIMEOUT};

/// Events that drive a client transaction.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// A response whose Via branch and CSeq matched this transaction.
    Response(SipMessage),
    /// The retransmission timer fired (Timer E).
    RetryFired,
    /// The transaction lifetime timer fired (Timer F).
    TimeoutFired,
}

/// Actions the runtime must perform on behalf of the transaction.
///
/// `ScheduleRetry` replaces any pending retry timer for this transaction;
/// the same holds for `ScheduleTimeout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionAction {
    Transmit(Bytes),
    ScheduleRetry(Duration),
    ScheduleTimeout(Duration),
    CancelTimers,
    /// The transaction reached a terminal state. Carries the final response,
    /// or `None` when the request timed out.
    Finished(Option<SipMessage>),
}

/// A non-INVITE client transaction (RFC 3261 Figure 7).
///
/// The request is serialized once at start; retransmissions resend the same
/// bytes. The retransmission interval starts at T1 and doubles up to T2;
/// a provisional response moves the machine to Proceeding and pins the
/// interval at T2. A final response or the 64*T1 timeout finishes the
/// transaction, after which every further event is ignored.
#[derive(Debug)]
pub struct ClientTransaction {
    request: SipMessage,
    wire: Bytes,
    state: TransactionState,
    retry_interval: Duration,
    response: Option<SipMessage>,
}

impl ClientTransaction {
    /// Starts a transaction: transmits the request and arms both timers.
    pub fn start(request: SipMessage) -> (ClientTransaction, Vec<TransactionAction>) {
        let wire = request.to_bytes();
        let tx = ClientTransaction {
            request,
            wire: wire.clone(),
            state: TransactionState::Trying,
            retry_interval: T1,
            response: None,
        };
        let actions = vec![
            TransactionAction::Transmit(wire),
            TransactionAction::ScheduleRetry(T1),
            TransactionAction::ScheduleTimeout(TIMEOUT),
        ];
        (tx, actions)
    }

    /// Handles an event, returning the resulting actions.
    pub fn on_event(&mut self, event: TransactionEvent) -> Vec<TransactionAction> {
        match (self.state, event) {
            (
                TransactionState::Trying | TransactionState::Proceeding,
                TransactionEvent::Response(response),
            ) => self.handle_response(response),
            (
                TransactionState::Trying | TransactionState::Proceeding,
                TransactionEvent::RetryFired,
            ) => self.handle_retry(),
            (
                TransactionState::Trying | TransactionState::Proceeding,
                TransactionEvent::TimeoutFired,
            ) => self.handle_timeout(),
            (_, _) => Vec::new(),
        }
    }

    fn handle_response(&mut self, response: SipMessage) -> Vec<TransactionAction> {
        let code = response.status_code().unwrap_or(0);
        if code < 200 {
            if self.state == TransactionState::Trying {
                self.state = TransactionState::Proceeding;
                self.retry_interval = T2;
                return vec![TransactionAction::ScheduleRetry(T2)];
            }
            return Vec::new();
        }
        self.state = TransactionState::Completed;
        self.response = Some(response.clone());
        vec![
            TransactionAction::CancelTimers,
            TransactionAction::Finished(Some(response)),
        ]
    }

    fn handle_retry(&mut self) -> Vec<TransactionAction> {
        self.retry_interval = (self.retry_interval * 2).min(T2);
        vec![
            TransactionAction::Transmit(self.wire.clone()),
            TransactionAction::ScheduleRetry(self.retry_interval),
        ]
    }

    fn handle_timeout(&mut self) -> Vec<TransactionAction> {
        self.state = TransactionState::Terminated;
        vec![
            TransactionAction::CancelTimers,
            TransactionAction::Finished(None),
        ]
    }

    pub fn request(&self) -> &SipMessage {
        &self.request
    }

    /// The final response, present once the transaction completed normally.
    pub fn response(&self) -> Option<&SipMessage> {
        self.response.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// The request method, used to route completion handling.
    pub fn method(&self) -> Option<&Method> {
        self.request.method()
    }

    /// The Via branch identifying this transaction on the wire.
    pub fn branch(&self) -> Option<SmolStr> {
        self.request
            .header("Via")
            .and_then(|via| branch_from_via(&via))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_request() -> SipMessage {
        let mut req = SipMessage::request(Method::Register, "sip:example.com");
        req.add_header(
            "Via",
            "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-test1;rport",
        );
        req.add_header("CSeq", "1 REGISTER");
        req
    }

    #[test]
    fn start_transmits_and_arms_timers() {
        let (tx, actions) = ClientTransaction::start(register_request());
        assert_eq!(tx.state(), TransactionState::Trying);
        assert!(matches!(actions[0], TransactionAction::Transmit(_)));
        assert_eq!(actions[1], TransactionAction::ScheduleRetry(T1));
        assert_eq!(actions[2], TransactionAction::ScheduleTimeout(TIMEOUT));
    }

    #[test]
    fn retransmission_interval_doubles_up_to_t2() {
        let (mut tx, _) = ClientTransaction::start(register_request());
        let mut intervals = Vec::new();
        for _ in 0..5 {
            let actions = tx.on_event(TransactionEvent::RetryFired);
            assert!(matches!(actions[0], TransactionAction::Transmit(_)));
            match actions[1] {
                TransactionAction::ScheduleRetry(d) => intervals.push(d.as_millis()),
                ref other => panic!("expected retry schedule, got {:?}", other),
            }
        }
        assert_eq!(intervals, [1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn provisional_moves_to_proceeding_and_pins_t2() {
        let (mut tx, _) = ClientTransaction::start(register_request());
        let ringing = SipMessage::response(100, "Trying");
        let actions = tx.on_event(TransactionEvent::Response(ringing.clone()));
        assert_eq!(tx.state(), TransactionState::Proceeding);
        assert_eq!(actions, vec![TransactionAction::ScheduleRetry(T2)]);

        // a second provisional changes nothing
        assert!(tx.on_event(TransactionEvent::Response(ringing)).is_empty());

        // retries stay at T2
        let actions = tx.on_event(TransactionEvent::RetryFired);
        assert_eq!(actions[1], TransactionAction::ScheduleRetry(T2));
    }

    #[test]
    fn final_response_completes_once() {
        let (mut tx, _) = ClientTransaction::start(register_request());
        let ok = SipMessage::response(200, "OK");
        let actions = tx.on_event(TransactionEvent::Response(ok.clone()));
        assert_eq!(tx.state(), TransactionState::Completed);
        assert_eq!(actions[0], TransactionAction::CancelTimers);
        assert_eq!(actions[1], TransactionAction::Finished(Some(ok.clone())));
        assert_eq!(tx.response().unwrap().status_code(), Some(200));

        // retransmitted finals and late timers are ignored
        assert!(tx.on_event(TransactionEvent::Response(ok)).is_empty());
        assert!(tx.on_event(TransactionEvent::RetryFired).is_empty());
        assert!(tx.on_event(TransactionEvent::TimeoutFired).is_empty());
    }

    #[test]
    fn timeout_finishes_without_response() {
        let (mut tx, _) = ClientTransaction::start(register_request());
        let actions = tx.on_event(TransactionEvent::TimeoutFired);
        assert_eq!(tx.state(), TransactionState::Terminated);
        assert_eq!(actions[0], TransactionAction::CancelTimers);
        assert_eq!(actions[1], TransactionAction::Finished(None));
        assert!(tx.response().is_none());
    }

    #[test]
    fn branch_comes_from_the_via_header() {
        let (tx, _) = ClientTransaction::start(register_request());
        assert_eq!(tx.branch().unwrap(), "z9hG4bK-test1");
        assert_eq!(tx.method(), Some(&Method::Register));
    }
}
