// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CIDR admission control for accepted sockets.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

use crate::errors::ConfigError;

/// Immutable allow-list of CIDR blocks. An empty list admits everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    blocks: Vec<IpNet>,
}

impl Acl {
    /// Builds the list from CIDR strings. A bare address is accepted as a host route.
    pub fn new<S: AsRef<str>>(cidrs: &[S]) -> Result<Self, ConfigError> {
        let blocks = cidrs
            .iter()
            .map(|cidr| parse_block(cidr.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Acl { blocks })
    }

    #[must_use]
    pub fn allow_all() -> Self {
        Acl::default()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn blocks(&self) -> &[IpNet] {
        &self.blocks
    }

    /// True if the list is empty or any block contains the remote address.
    #[must_use]
    pub fn admit(&self, remote: &SocketAddr) -> bool {
        self.admit_ip(remote.ip())
    }

    /// Same as [`Acl::admit`] for a textual address (`ip:port` or bare `ip`).
    /// Anything that does not parse is rejected.
    #[must_use]
    pub fn admit_str(&self, remote: &str) -> bool {
        let remote = remote.trim();
        if let Ok(addr) = remote.parse::<SocketAddr>() {
            return self.admit(&addr);
        }
        match remote.parse::<IpAddr>() {
            Ok(ip) => self.admit_ip(ip),
            Err(_) => false,
        }
    }

    fn admit_ip(&self, ip: IpAddr) -> bool {
        if self.blocks.is_empty() {
            return true;
        }
        // dual-stack sockets report IPv4 peers as ::ffff:a.b.c.d
        let ip = ip.to_canonical();
        self.blocks.iter().any(|block| block.contains(&ip))
    }
}

fn parse_block(cidr: &str) -> Result<IpNet, ConfigError> {
    let cidr = cidr.trim();
    if let Ok(net) = cidr.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    cidr.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ConfigError::InvalidCidr(cidr.to_string()))
}
