// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Webhook URL acceptance rules.
//!
//! URLs are checked once, when registered or saved. The sender trusts
//! stored values and performs no runtime validation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("invalid URL: {0}")]
    Invalid(String),

    #[error("only https webhooks are allowed, got {0}")]
    SchemeNotAllowed(String),

    #[error("webhook URL must not contain credentials")]
    Credentials,

    #[error("webhook URL must not contain a fragment")]
    Fragment,

    #[error("webhook URL has no host")]
    MissingHost,

    #[error("webhook host {0} is an internal address")]
    InternalHost(String),

    #[error("webhook host {0} is not in the allow-list")]
    NotAllowListed(String),
}

/// Optional operator restriction on webhook hosts.
///
/// Entries are exact hostnames (`hooks.example.com`) or suffixes written
/// with a leading dot (`.example.com`, which matches any subdomain but not
/// `example.com` itself). An empty list allows every public host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAllowList {
    entries: Vec<String>,
}

impl HostAllowList {
    /// Parse a comma-separated list such as `WEBHOOK_ALLOWED_HOSTS`.
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split(',')
            .map(|entry| entry.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|entry| !entry.is_empty() && entry != ".")
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn allows(&self, host: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.entries.iter().any(|entry| {
            if entry.starts_with('.') {
                host.ends_with(entry.as_str())
            } else {
                host == *entry
            }
        })
    }
}

/// Accept a webhook URL or explain why not. Returns the parsed URL.
pub fn validate_webhook_url(raw: &str, allow_list: &HostAllowList) -> Result<Url, UrlValidationError> {
    let url = Url::parse(raw.trim()).map_err(|e| UrlValidationError::Invalid(e.to_string()))?;

    if url.scheme() != "https" {
        return Err(UrlValidationError::SchemeNotAllowed(url.scheme().to_string()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::Credentials);
    }
    if url.fragment().is_some() {
        return Err(UrlValidationError::Fragment);
    }

    let host = url.host().ok_or(UrlValidationError::MissingHost)?;
    let host_text = match &host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain.is_empty() {
                return Err(UrlValidationError::MissingHost);
            }
            if is_internal_name(&domain) {
                return Err(UrlValidationError::InternalHost(domain));
            }
            domain
        }
        Host::Ipv4(ip) => {
            if is_internal_ip(IpAddr::V4(*ip)) {
                return Err(UrlValidationError::InternalHost(ip.to_string()));
            }
            ip.to_string()
        }
        Host::Ipv6(ip) => {
            if is_internal_ip(IpAddr::V6(*ip)) {
                return Err(UrlValidationError::InternalHost(ip.to_string()));
            }
            ip.to_string()
        }
    };

    if !allow_list.allows(&host_text) {
        return Err(UrlValidationError::NotAllowListed(host_text));
    }

    Ok(url)
}

fn is_internal_name(domain: &str) -> bool {
    domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
}

/// Loopback, private, link-local (unicast and multicast), or unspecified.
pub fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal_v4(v4),
            None => is_internal_v6(v6),
        },
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 224.0.0.0/24, link-local multicast
        || (a == 224 && b == 0 && c == 0)
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7, unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10, link-local unicast
        || (first & 0xffc0) == 0xfe80
        // ff02::/16, link-local multicast
        || (first & 0xff0f) == 0xff02
}
