// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types: methods, headers, and the wire message codec.

mod headers;
mod method;
mod msg;

pub use headers::{expand_compact_name, Header, Headers};
pub use method::Method;
pub use msg::{value_parameters, SipMessage, StartLine};
