//! Immutable configuration snapshot shared by all handlers.
//!
//! A snapshot is built once per `update_config` and swapped in whole, so a
//! handler that loaded one sees rules, proxies and the compiled table from
//! the same update.

use crate::config::{rules_for_profile, ProxyDescriptor, RuleDescriptor};
use crate::matcher::{Route, RuleMatcher, SkippedRule};
use std::collections::HashMap;

/// Routing outcome for one target, resolved against the proxy table.
#[derive(Debug, Clone, Copy)]
pub enum Decision<'a> {
    /// A rule matched and routes direct.
    Direct,
    /// A rule matched and names a known proxy.
    Proxy(&'a ProxyDescriptor),
    /// A rule matched but names a proxy that is not configured.
    UnknownProxy(&'a str),
    /// No rule matched.
    NoMatch,
}

#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    proxies: HashMap<String, ProxyDescriptor>,
    rules: Vec<RuleDescriptor>,
    matcher: RuleMatcher,
    active_profile: Option<String>,
}

impl ConfigSnapshot {
    /// Filter `rules` by profile, compile them, and index `proxies`.
    ///
    /// Returns the rules that were dropped as malformed alongside.
    #[must_use]
    pub fn build(
        rules: &[RuleDescriptor],
        proxies: &[ProxyDescriptor],
        active_profile: Option<String>,
    ) -> (Self, Vec<SkippedRule>) {
        let rules = rules_for_profile(rules, active_profile.as_deref());
        let (matcher, skipped) = RuleMatcher::build(&rules);
        let proxies = proxies
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        let snapshot = Self {
            proxies,
            rules,
            matcher,
            active_profile,
        };
        (snapshot, skipped)
    }

    #[must_use]
    pub fn resolve(&self, host: &str, port: Option<u16>) -> Decision<'_> {
        match self.matcher.find(host, port) {
            None => Decision::NoMatch,
            Some(Route::Direct) => Decision::Direct,
            Some(Route::Proxy(id)) => match self.proxies.get(id) {
                Some(proxy) => Decision::Proxy(proxy),
                None => Decision::UnknownProxy(id),
            },
        }
    }

    #[must_use]
    pub fn proxy(&self, id: &str) -> Option<&ProxyDescriptor> {
        self.proxies.get(id)
    }

    /// Configured proxies, sorted by id.
    #[must_use]
    pub fn proxies(&self) -> Vec<&ProxyDescriptor> {
        let mut proxies: Vec<_> = self.proxies.values().collect();
        proxies.sort_by(|a, b| a.id.cmp(&b.id));
        proxies
    }

    /// Rules in effect after profile filtering (including disabled ones).
    #[must_use]
    pub fn rules(&self) -> &[RuleDescriptor] {
        &self.rules
    }

    #[must_use]
    pub fn active_profile(&self) -> Option<&str> {
        self.active_profile.as_deref()
    }

    /// Number of compiled matcher entries.
    #[must_use]
    pub fn compiled_len(&self) -> usize {
        self.matcher.len()
    }
}
