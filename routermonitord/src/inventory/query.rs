use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use shared::protocol::{render_expiry, render_timestamp};
use shared::{ClientRecord, InventoryEntry};
use thiserror::Error;

/// Listing order for inventory and DHCP snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Hostname,
    Ip,
    FirstSeen,
    Expiry,
    Mac,
    Vendor,
    Notes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sort key {0:?} (expected one of hostname, ip, first_seen, expiry, mac, vendor, notes)")]
pub struct UnknownSortKey(pub String);

impl FromStr for SortKey {
    type Err = UnknownSortKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "hostname" => Ok(SortKey::Hostname),
            "ip" => Ok(SortKey::Ip),
            "first_seen" => Ok(SortKey::FirstSeen),
            "expiry" => Ok(SortKey::Expiry),
            "mac" => Ok(SortKey::Mac),
            "vendor" | "macoui" => Ok(SortKey::Vendor),
            "notes" => Ok(SortKey::Notes),
            _ => Err(UnknownSortKey(s.to_string())),
        }
    }
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Hostname => "hostname",
            SortKey::Ip => "ip",
            SortKey::FirstSeen => "first_seen",
            SortKey::Expiry => "expiry",
            SortKey::Mac => "mac",
            SortKey::Vendor => "vendor",
            SortKey::Notes => "notes",
        }
    }

    /// Whether the key exists on a bare DHCP record
    pub fn applies_to_records(&self) -> bool {
        matches!(self, SortKey::Hostname | SortKey::Ip | SortKey::Expiry | SortKey::Mac)
    }

    pub fn compare(&self, a: &InventoryEntry, b: &InventoryEntry) -> Ordering {
        let primary = match self {
            SortKey::Hostname => cmp_text(&a.hostname, &b.hostname),
            SortKey::Ip => cmp_text(&a.ip, &b.ip),
            SortKey::FirstSeen => a.first_seen.cmp(&b.first_seen),
            SortKey::Expiry => a.lease_expiry.cmp(&b.lease_expiry),
            SortKey::Mac => Ordering::Equal,
            SortKey::Vendor => cmp_text(&a.vendor, &b.vendor),
            SortKey::Notes => cmp_text(&a.notes, &b.notes),
        };
        primary.then_with(|| a.mac.cmp(&b.mac))
    }

    /// Keys that a record lacks sort by hostname
    pub fn compare_records(&self, a: &ClientRecord, b: &ClientRecord) -> Ordering {
        let primary = match self {
            SortKey::Ip => cmp_text(&a.ip, &b.ip),
            SortKey::Expiry => a.lease_expiry.cmp(&b.lease_expiry),
            SortKey::Mac => Ordering::Equal,
            _ => cmp_text(&a.hostname, &b.hostname),
        };
        primary.then_with(|| a.mac.cmp(&b.mac))
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn cmp_text(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

/// Case-insensitive substring match over every textual column, including
/// the rendered timestamps. An empty needle matches everything.
pub fn matches_search(entry: &InventoryEntry, needle: &str) -> bool {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }

    let haystacks = [
        entry.mac.to_string(),
        entry.hostname.to_lowercase(),
        entry.ip.to_lowercase(),
        entry.vendor.to_lowercase(),
        entry.notes.to_lowercase(),
        render_timestamp(entry.first_seen).to_lowercase(),
        render_expiry(entry.lease_expiry).to_lowercase(),
    ];
    haystacks.iter().any(|h| h.contains(&needle))
}

pub fn sort_entries(entries: &mut [InventoryEntry], key: SortKey) {
    entries.sort_by(|a, b| key.compare(a, b));
}

pub fn sort_records(records: &mut [ClientRecord], key: SortKey) {
    records.sort_by(|a, b| key.compare_records(a, b));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mac: &str, hostname: &str, ip: &str, vendor: &str, first_seen: i64) -> InventoryEntry {
        InventoryEntry {
            mac: mac.parse().unwrap(),
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            lease_expiry: 0,
            vendor: vendor.to_string(),
            first_seen,
            notes: String::new(),
        }
    }

    #[test]
    fn test_parse_sort_keys() {
        assert_eq!("hostname".parse::<SortKey>().unwrap(), SortKey::Hostname);
        assert_eq!("IP".parse::<SortKey>().unwrap(), SortKey::Ip);
        assert_eq!("MAC".parse::<SortKey>().unwrap(), SortKey::Mac);
        assert_eq!("MACOUI".parse::<SortKey>().unwrap(), SortKey::Vendor);
        assert_eq!("first-seen".parse::<SortKey>().unwrap(), SortKey::FirstSeen);
        assert!("color".parse::<SortKey>().is_err());
    }

    #[test]
    fn test_unknown_sort_key_names_the_choices() {
        let err = "color".parse::<SortKey>().unwrap_err();
        assert_eq!(err, UnknownSortKey("color".to_string()));
        let message = err.to_string();
        assert!(message.starts_with("unknown sort key \"color\""));
        assert!(message.contains("first_seen"));

        // clap needs the parse error as a boxed std error
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        assert!(boxed.to_string().contains("vendor"));
    }

    #[test]
    fn test_text_sort_ignores_case() {
        let mut entries = vec![
            entry("aa:bb:cc:00:00:01", "zeta", "10.0.0.1", "b", 3),
            entry("aa:bb:cc:00:00:02", "Alpha", "10.0.0.2", "A", 1),
            entry("aa:bb:cc:00:00:03", "beta", "10.0.0.3", "c", 2),
        ];
        sort_entries(&mut entries, SortKey::Hostname);
        let names: Vec<_> = entries.iter().map(|e| e.hostname.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta", "zeta"]);

        sort_entries(&mut entries, SortKey::FirstSeen);
        let seen: Vec<_> = entries.iter().map(|e| e.first_seen).collect();
        assert_eq!(seen, vec![1, 2, 3]);

        sort_entries(&mut entries, SortKey::Mac);
        assert_eq!(entries[0].mac.to_string(), "aa:bb:cc:00:00:01");
    }

    #[test]
    fn test_search_covers_all_text_columns() {
        let mut e = entry("aa:bb:cc:00:00:01", "Kitchen-Pi", "192.168.1.50", "Raspberry Pi Trading", 1);
        e.notes = "Garage Door".into();

        assert!(matches_search(&e, ""));
        assert!(matches_search(&e, "kitchen"));
        assert!(matches_search(&e, "168.1.5"));
        assert!(matches_search(&e, "AA:BB"));
        assert!(matches_search(&e, "raspberry"));
        assert!(matches_search(&e, "garage"));
        assert!(matches_search(&e, "static lease"));
        assert!(!matches_search(&e, "printer"));
    }

    #[test]
    fn test_record_sort_falls_back_to_hostname() {
        let rec = |mac: &str, hostname: &str| ClientRecord {
            mac: mac.parse().unwrap(),
            hostname: hostname.to_string(),
            ip: String::new(),
            lease_expiry: 0,
        };
        let mut records = vec![rec("aa:bb:cc:00:00:01", "b"), rec("aa:bb:cc:00:00:02", "A")];
        assert!(!SortKey::Notes.applies_to_records());
        sort_records(&mut records, SortKey::Notes);
        assert_eq!(records[0].hostname, "A");
    }
}
