// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client transaction layer: a sans-io state machine wrapping one
//! non-INVITE request with its retransmission and timeout timers.
//!
//! The machine never touches a socket or a clock. Feeding it an event
//! returns the actions the runtime must perform (transmit a datagram,
//! arm or cancel a timer, deliver the outcome), which keeps every timing
//! property testable without sleeping.

mod fsm;

use rand::Rng;
use smol_str::SmolStr;
use softsip_core::value_parameters;

pub use fsm::{ClientTransaction, TransactionAction, TransactionEvent};

use std::time::Duration;

/// RFC 3261 T1: RTT estimate and initial retransmission interval.
pub const T1: Duration = Duration::from_millis(500);
/// RFC 3261 T2: retransmission interval cap for non-INVITE requests.
pub const T2: Duration = Duration::from_millis(4000);
/// Transaction lifetime, 64*T1 (Timer F).
pub const TIMEOUT: Duration = Duration::from_millis(32_000);

/// Client transaction states per RFC 3261 Figure 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Generates a Via branch parameter with the RFC 3261 magic cookie prefix.
pub fn generate_branch() -> SmolStr {
    let mut rng = rand::thread_rng();
    let mut branch = String::from("z9hG4bK-");
    for _ in 0..16 {
        let nibble: u8 = rng.gen_range(0..16);
        branch.push(char::from_digit(nibble as u32, 16).unwrap_or('0'));
    }
    SmolStr::new(branch)
}

/// Extracts the branch parameter from a Via header value.
pub fn branch_from_via(via: &str) -> Option<SmolStr> {
    value_parameters(via)
        .into_iter()
        .find(|(key, _)| key == "branch")
        .map(|(_, value)| value)
}
