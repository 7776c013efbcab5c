//! Deterministic hostnames for tenant control planes

use std::fmt;

/// Longest hostname DNS accepts, without the trailing dot
pub const HOSTNAME_MAX_LEN: usize = 253;

/// Hostname parts for one tenant cluster
///
/// The full hostname is `{cluster}.{tenant}.{domain}`, so every cluster of a
/// tenant lives under the tenant's own subdomain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantHostname {
    domain: String,
    tenant: String,
    cluster: String,
}

impl TenantHostname {
    /// Build the hostname for `cluster` owned by `tenant` under `domain`
    pub fn new(
        domain: impl Into<String>,
        tenant: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into().trim_matches('.').to_string(),
            tenant: tenant.into(),
            cluster: cluster.into(),
        }
    }

    /// The cluster's fully qualified hostname
    pub fn fqdn(&self) -> String {
        format!("{}.{}.{}", self.cluster, self.tenant, self.domain)
    }

    /// The hostname, or a description of why DNS would refuse it
    pub fn checked_fqdn(&self) -> Result<String, String> {
        let fqdn = self.fqdn();
        if fqdn.len() > HOSTNAME_MAX_LEN {
            return Err(format!(
                "hostname {fqdn} is {} characters, longer than the {HOSTNAME_MAX_LEN} DNS allows",
                fqdn.len()
            ));
        }
        Ok(fqdn)
    }
}

impl fmt::Display for TenantHostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fqdn())
    }
}
