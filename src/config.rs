//! Registry and zone configuration.
//!
//! The hosting node parses its config file; the structures here are the
//! decoded form it hands over. A zone's role is never configured
//! directly — it is derived from which fields are set: an authoritative
//! zone with an SOA contact email is the primary, an authoritative zone
//! without one is a secondary, and a non-authoritative zone caches.

use core::str::FromStr;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::rdata::StoredName;

//------------ ZoneRole ------------------------------------------------------

/// What a zone is to its data: origin, replica or cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneRole {
    /// Authoritative origin; writes land here and bump the serial.
    Primary,

    /// Authoritative replica kept fresh by SOA polling and AXFR.
    Secondary,

    /// Non-authoritative; populated on demand, evicted by TTL.
    Caching,
}

impl ZoneRole {
    pub fn is_authoritative(self) -> bool {
        !matches!(self, ZoneRole::Caching)
    }
}

//------------ SoaConfig -----------------------------------------------------

/// The configured parts of a zone's SOA record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SoaConfig {
    /// Contact address; its presence makes an authoritative zone primary.
    pub email: Option<String>,

    /// SOA REFRESH in seconds.
    pub refresh: u32,

    /// SOA RETRY in seconds.
    pub retry: u32,

    /// SOA EXPIRE in seconds.
    pub expire: u32,

    /// SOA MINIMUM in seconds, also the negative-caching TTL.
    pub minimum: u32,
}

impl Default for SoaConfig {
    fn default() -> Self {
        SoaConfig {
            email: None,
            refresh: 3600,
            retry: 600,
            expire: 604_800,
            minimum: 600,
        }
    }
}

impl SoaConfig {
    /// The RNAME form of the contact email.
    ///
    /// `admin@example.com` becomes `admin.example.com`; without an email
    /// the conventional `hostmaster` below the apex is used.
    pub fn rname(&self, apex: &StoredName) -> StoredName {
        let s = match &self.email {
            Some(email) => email.replacen('@', ".", 1),
            None => format!("hostmaster.{apex}"),
        };
        StoredName::from_str(&s).unwrap_or_else(|_| {
            StoredName::from_str(&format!("hostmaster.{apex}"))
                .expect("apex is a valid name")
        })
    }
}

//------------ ZoneConfig ----------------------------------------------------

/// Configuration of a single zone.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Whether this node is authoritative for the zone.
    pub authoritative: bool,

    pub soa: SoaConfig,

    /// The name of the zone's primary name server, used as the SOA MNAME
    /// and NS target.
    pub primary: Option<String>,

    /// Upstream DNS servers; queried by secondary and caching zones.
    pub query_servers: Vec<SocketAddr>,

    /// Where a secondary redirects registration writes to: the primary's
    /// registry API endpoint.
    pub redirect_register: Option<String>,

    /// Peers allowed to request zone transfers.
    pub allow_transfer: Vec<IpAddr>,
}

impl ZoneConfig {
    /// Derives the zone's role. Fixed for the lifetime of the zone.
    pub fn role(&self) -> ZoneRole {
        match (self.authoritative, self.soa.email.is_some()) {
            (true, true) => ZoneRole::Primary,
            (true, false) => ZoneRole::Secondary,
            (false, _) => ZoneRole::Caching,
        }
    }

    /// The SOA MNAME under the given apex.
    pub fn mname(&self, apex: &StoredName) -> StoredName {
        let s = match &self.primary {
            Some(primary) => primary.clone(),
            None => format!("ns1.{apex}"),
        };
        StoredName::from_str(&s).unwrap_or_else(|_| {
            StoredName::from_str(&format!("ns1.{apex}"))
                .expect("apex is a valid name")
        })
    }
}

//------------ TransferAcl ---------------------------------------------------

/// The set of peers a zone hands transfers to.
#[derive(Clone, Debug, Default)]
pub struct TransferAcl {
    entries: HashSet<IpAddr>,
}

impl TransferAcl {
    pub fn new(addrs: &[IpAddr]) -> Self {
        TransferAcl {
            entries: addrs.iter().copied().collect(),
        }
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.entries.contains(&ip)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//------------ RegistryConfig ------------------------------------------------

/// Configuration of the whole registry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// The realm domain the three zones hang off, e.g. `bosagora.io`.
    pub realm: String,

    pub realm_zone: ZoneConfig,
    pub validators_zone: ZoneConfig,
    pub flash_zone: ZoneConfig,

    /// Upper bound on UDP response sizes negotiated via EDNS.
    pub max_udp_payload: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            realm: "realm".into(),
            realm_zone: ZoneConfig::default(),
            validators_zone: ZoneConfig::default(),
            flash_zone: ZoneConfig::default(),
            max_udp_payload: 4096,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_derived_from_config_shape() {
        let mut config = ZoneConfig {
            authoritative: true,
            ..Default::default()
        };
        config.soa.email = Some("admin@example.com".into());
        assert_eq!(config.role(), ZoneRole::Primary);

        config.soa.email = None;
        assert_eq!(config.role(), ZoneRole::Secondary);

        config.authoritative = false;
        assert_eq!(config.role(), ZoneRole::Caching);
    }

    #[test]
    fn rname_maps_email() {
        let apex = StoredName::from_str("validators.unittest").unwrap();
        let soa = SoaConfig {
            email: Some("admin@example.com".into()),
            ..Default::default()
        };
        assert_eq!(
            soa.rname(&apex),
            StoredName::from_str("admin.example.com").unwrap()
        );
        assert_eq!(
            SoaConfig::default().rname(&apex),
            StoredName::from_str("hostmaster.validators.unittest").unwrap()
        );
    }

    #[test]
    fn transfer_acl_matches_ips() {
        let acl = TransferAcl::new(&["192.0.2.1".parse().unwrap()]);
        assert!(acl.allows("192.0.2.1".parse().unwrap()));
        assert!(!acl.allows("192.0.2.2".parse().unwrap()));
    }
}
