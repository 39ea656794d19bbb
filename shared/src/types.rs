use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A 48-bit hardware address.
/// Displays in canonical form: lowercase, colon-separated octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address: {0:?}")]
pub struct MacParseError(pub String);

impl MacAddr {
    /// Organizationally unique prefix, e.g. "00:05:cd"
    pub fn oui_prefix(&self) -> String {
        format!("{:02x}:{:02x}:{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF`, `aabb.ccdd.eeff`
    /// and bare `aabbccddeeff`, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || MacParseError(s.to_string());

        let hex: String = if trimmed.contains([':', '-']) {
            let parts: Vec<&str> = trimmed.split([':', '-']).collect();
            if parts.len() != 6 || parts.iter().any(|p| p.is_empty() || p.len() > 2) {
                return Err(err());
            }
            // Some servers drop leading zeros ("0:d:c5:...")
            parts.iter().map(|p| format!("{:0>2}", p)).collect()
        } else {
            trimmed.replace('.', "")
        };

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(err());
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| err())?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A client as reported by the DHCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub mac: MacAddr,

    /// May be empty
    pub hostname: String,

    /// Dotted quad; empty for some static entries
    pub ip: String,

    /// Seconds since epoch, or `STATIC_LEASE` (0) for a non-expiring lease
    pub lease_expiry: i64,
}

/// A client as persisted in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub mac: MacAddr,
    pub hostname: String,
    pub ip: String,
    pub lease_expiry: i64,

    /// Vendor lookup result, or `VENDOR_NOT_FOUND`
    pub vendor: String,

    /// Seconds since epoch; written once at insert
    pub first_seen: i64,

    /// Operator notes; never touched by reconciliation
    pub notes: String,
}

impl InventoryEntry {
    pub fn new(record: ClientRecord, vendor: String, first_seen: i64) -> Self {
        Self {
            mac: record.mac,
            hostname: record.hostname,
            ip: record.ip,
            lease_expiry: record.lease_expiry,
            vendor,
            first_seen,
            notes: String::new(),
        }
    }
}

/// Fields that reconciliation tracks for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientField {
    Hostname,
    Ip,
    Expiry,
}

impl ClientField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientField::Hostname => "hostname",
            ClientField::Ip => "ip",
            ClientField::Expiry => "expiry",
        }
    }
}

impl fmt::Display for ClientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-field difference between stored and observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldChange {
    Hostname { old: String, new: String },
    Ip { old: String, new: String },
    Expiry { old: i64, new: i64 },
}

impl FieldChange {
    pub fn field(&self) -> ClientField {
        match self {
            FieldChange::Hostname { .. } => ClientField::Hostname,
            FieldChange::Ip { .. } => ClientField::Ip,
            FieldChange::Expiry { .. } => ClientField::Expiry,
        }
    }

    /// Compare the tracked fields of a stored entry against an observed record.
    /// Order is hostname, ip, expiry.
    pub fn diff(stored: &InventoryEntry, observed: &ClientRecord) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        if stored.hostname != observed.hostname {
            changes.push(FieldChange::Hostname {
                old: stored.hostname.clone(),
                new: observed.hostname.clone(),
            });
        }
        if stored.ip != observed.ip {
            changes.push(FieldChange::Ip {
                old: stored.ip.clone(),
                new: observed.ip.clone(),
            });
        }
        if stored.lease_expiry != observed.lease_expiry {
            changes.push(FieldChange::Expiry {
                old: stored.lease_expiry,
                new: observed.lease_expiry,
            });
        }
        changes
    }

    /// Apply the new value to an entry in memory.
    pub fn apply(&self, entry: &mut InventoryEntry) {
        match self {
            FieldChange::Hostname { new, .. } => entry.hostname = new.clone(),
            FieldChange::Ip { new, .. } => entry.ip = new.clone(),
            FieldChange::Expiry { new, .. } => entry.lease_expiry = *new,
        }
    }

    /// Human-readable new value; expiry is rendered as local time.
    pub fn new_value_display(&self) -> String {
        match self {
            FieldChange::Hostname { new, .. } | FieldChange::Ip { new, .. } => new.clone(),
            FieldChange::Expiry { new, .. } => crate::protocol::render_expiry(*new),
        }
    }
}

/// Output of one reconciliation, consumed by the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    NewClient {
        mac: MacAddr,
        record: ClientRecord,
        vendor: String,
    },
    FieldChanged {
        mac: MacAddr,
        /// Hostname as stored before this cycle, for context in messages
        hostname: String,
        change: FieldChange,
    },
}

impl ChangeEvent {
    pub fn mac(&self) -> MacAddr {
        match self {
            ChangeEvent::NewClient { mac, .. } | ChangeEvent::FieldChanged { mac, .. } => *mac,
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            ChangeEvent::NewClient { .. } => "New LAN client found",
            ChangeEvent::FieldChanged { .. } => "LAN client changed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ChangeEvent::NewClient { mac, record, vendor } => format!(
                "\n  Hostname:    {}\n  IP address:  {}\n  MAC:         {}\n  Vendor:      {}",
                record.hostname, record.ip, mac, vendor
            ),
            ChangeEvent::FieldChanged { mac, hostname, change } => format!(
                "{} / {:<20} New {}: {}",
                mac,
                hostname,
                change.field(),
                change.new_value_display()
            ),
        }
    }
}
