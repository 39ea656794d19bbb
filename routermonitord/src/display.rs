use std::fmt::Write;
use shared::protocol::{render_expiry, render_timestamp};
use shared::{ClientRecord, InventoryEntry};

/// Cut `text` to `width` characters, marking the cut with '~'
fn fit(text: &str, width: usize) -> String {
    if text.chars().count() <= width || width == 0 {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('~');
    cut
}

/// Inventory table; the vendor column is cut to `vendor_width`
pub fn inventory_table(entries: &[InventoryEntry], vendor_width: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:<15} {:<17} {:<19} {:<19} {:<vw$} {}",
        "hostname",
        "ip",
        "mac",
        "first seen",
        "expiry",
        "vendor",
        "notes",
        vw = vendor_width
    );
    for e in entries {
        let _ = writeln!(
            out,
            "{:<24} {:<15} {:<17} {:<19} {:<19} {:<vw$} {}",
            e.hostname,
            e.ip,
            e.mac,
            render_timestamp(e.first_seen),
            render_expiry(e.lease_expiry),
            fit(&e.vendor, vendor_width),
            e.notes,
            vw = vendor_width
        );
    }
    let _ = writeln!(out, "{} clients", entries.len());
    out
}

/// Live DHCP snapshot table
pub fn snapshot_table(records: &[ClientRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<24} {:<15} {:<17} {}", "hostname", "ip", "mac", "expiry");
    for r in records {
        let _ = writeln!(
            out,
            "{:<24} {:<15} {:<17} {}",
            r.hostname,
            r.ip,
            r.mac,
            render_expiry(r.lease_expiry)
        );
    }
    let _ = writeln!(out, "{} leases", records.len());
    out
}

pub fn inventory_json(entries: &[InventoryEntry]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> InventoryEntry {
        InventoryEntry {
            mac: "aa:bb:cc:00:01:02".parse().unwrap(),
            hostname: "nas".to_string(),
            ip: "10.0.0.5".to_string(),
            lease_expiry: 0,
            vendor: "Synology Incorporated".to_string(),
            first_seen: 1_600_000_000,
            notes: "rack".to_string(),
        }
    }

    #[test]
    fn test_fit() {
        assert_eq!(fit("Acme", 10), "Acme");
        assert_eq!(fit("Synology Incorporated", 8), "Synolog~");
    }

    #[test]
    fn test_inventory_table() {
        let out = inventory_table(&[entry()], 8);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("aa:bb:cc:00:01:02"));
        assert!(lines[1].contains("static lease"));
        assert!(lines[1].contains("Synolog~"));
        assert!(lines[1].ends_with("rack"));
        assert_eq!(lines[2], "1 clients");
    }

    #[test]
    fn test_snapshot_table() {
        let e = entry();
        let record = ClientRecord {
            mac: e.mac,
            hostname: e.hostname,
            ip: e.ip,
            lease_expiry: 0,
        };
        let out = snapshot_table(&[record]);
        assert!(out.contains("10.0.0.5"));
        assert!(out.ends_with("1 leases\n"));
    }

    #[test]
    fn test_json_keeps_raw_timestamps() {
        let json = inventory_json(&[entry()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value[0]["mac"], "aa:bb:cc:00:01:02");
        assert_eq!(value[0]["lease_expiry"], 0);
        assert_eq!(value[0]["first_seen"], 1_600_000_000);
    }
}
