// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Service discovery: SRV lookups for `_sip._udp` and `_stun._udp`.
//!
//! A failed or empty SRV lookup is not an error at this layer; the engine
//! falls back to the conventional host names (`sip.<domain>:5060`,
//! `stun.<domain>:3478`).

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;
use smol_str::SmolStr;
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

/// DNS backend used by the driver.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// SRV targets sorted by priority, lowest first. Empty on failure.
    async fn lookup_srv(&self, name: &str) -> Vec<(SmolStr, u16)>;
    /// First address of the host, or `None` when the lookup fails.
    async fn lookup_host(&self, name: &str) -> Option<IpAddr>;
}

/// System resolver backed by trust-dns.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Creates a resolver using the default upstream configuration.
    pub fn new() -> Result<DnsResolver> {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(DnsResolver { resolver })
    }
}

#[async_trait]
impl SrvResolver for DnsResolver {
    async fn lookup_srv(&self, name: &str) -> Vec<(SmolStr, u16)> {
        let lookup = match self.resolver.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(_) => return Vec::new(),
        };
        let mut targets: Vec<(u16, SmolStr, u16)> = lookup
            .iter()
            .map(|rec| {
                let host = rec.target().to_utf8();
                (
                    rec.priority(),
                    SmolStr::new(host.trim_end_matches('.')),
                    rec.port(),
                )
            })
            .collect();
        targets.sort_by_key(|(priority, _, _)| *priority);
        targets
            .into_iter()
            .map(|(_, host, port)| (host, port))
            .collect()
    }

    async fn lookup_host(&self, name: &str) -> Option<IpAddr> {
        self.resolver
            .lookup_ip(name)
            .await
            .ok()
            .and_then(|lookup| lookup.iter().next())
    }
}

/// Fixed-answer resolver for tests and closed deployments.
#[derive(Default)]
pub struct StaticResolver {
    srv: HashMap<SmolStr, Vec<(SmolStr, u16)>>,
    hosts: HashMap<SmolStr, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        StaticResolver::default()
    }

    pub fn add_srv(mut self, name: &str, target: &str, port: u16) -> StaticResolver {
        self.srv
            .entry(SmolStr::new(name))
            .or_default()
            .push((SmolStr::new(target), port));
        self
    }

    pub fn add_host(mut self, name: &str, address: IpAddr) -> StaticResolver {
        self.hosts.insert(SmolStr::new(name), address);
        self
    }
}

#[async_trait]
impl SrvResolver for StaticResolver {
    async fn lookup_srv(&self, name: &str) -> Vec<(SmolStr, u16)> {
        self.srv.get(name).cloned().unwrap_or_default()
    }

    async fn lookup_host(&self, name: &str) -> Option<IpAddr> {
        self.hosts.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_answers_what_it_was_given() {
        let resolver = StaticResolver::new()
            .add_srv("_sip._udp.example.com", "sip1.example.com", 5062)
            .add_host("sip1.example.com", "192.0.2.10".parse().unwrap());

        let targets = resolver.lookup_srv("_sip._udp.example.com").await;
        assert_eq!(targets, vec![(SmolStr::new("sip1.example.com"), 5062)]);
        assert_eq!(
            resolver.lookup_host("sip1.example.com").await,
            Some("192.0.2.10".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn unknown_names_come_back_empty() {
        let resolver = StaticResolver::new();
        assert!(resolver.lookup_srv("_sip._udp.nowhere").await.is_empty());
        assert!(resolver.lookup_host("nowhere").await.is_none());
    }
}
