// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A small SIP user agent: registration with digest authentication, STUN
//! reflexive address discovery, and audio calls negotiated over SDP.
//!
//! The protocol behaviour lives in [`ClientEngine`], a state machine with
//! no I/O of its own. [`SipClient`] runs it on tokio, owning the socket,
//! timers, and DNS lookups, and surfaces progress as [`SipClientEvent`]s:
//!
//! ```no_run
//! use std::sync::Arc;
//! use softsip_agent::{ClientConfig, DnsResolver, SipClient, StaticMediaFactory};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ClientConfig::new("alice", "secret", "example.com");
//! let media = StaticMediaFactory::new("192.0.2.1".parse()?, 40000);
//! let mut client =
//!     SipClient::bind(config, Box::new(media), Arc::new(DnsResolver::new()?)).await?;
//! client.connect();
//! while let Some(event) = client.next_event().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

mod context;
mod dns;
mod driver;
mod engine;
mod events;
mod media;

pub use context::CallContext;
pub use dns::{DnsResolver, SrvResolver, StaticResolver};
pub use driver::SipClient;
pub use engine::{sip_address_to_uri, Action, ClientConfig, ClientEngine, Input, Service, Timer};
pub use events::{CallDirection, CallId, CallState, ClientState, SipClientEvent};
pub use media::{
    AudioChannel, GatheringSink, MediaFactory, MediaSession, SharedMedia, StaticMediaFactory,
};
