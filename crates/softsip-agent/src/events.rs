use smol_str::SmolStr;

/// The SIP Call-ID identifying a call towards the API user.
pub type CallId = SmolStr;

/// Registration state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Lifecycle of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Connecting,
    Active,
    Disconnecting,
    Finished,
}

/// Who initiated the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Notifications emitted by the engine towards the API user.
///
/// Events are the only way state changes surface; there are no callbacks
/// to register. The driver forwards them over an mpsc channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipClientEvent {
    ClientStateChanged(ClientState),
    /// A new incoming call is ringing; answer with `accept` or `hangup`.
    CallReceived { call: CallId, from: SmolStr },
    /// A call changed state. `error` is set when the call finished
    /// abnormally, formatted as `"<code>: <reason>"` for SIP failures.
    CallStateChanged {
        call: CallId,
        state: CallState,
        error: Option<SmolStr>,
    },
    /// The remote side is ringing (a 180 provisional arrived).
    CallRinging { call: CallId },
    /// Active call duration advanced, once per second.
    CallDuration { call: CallId, seconds: u64 },
    ActiveCallsChanged(usize),
}
