use chrono::{Local, TimeZone};

/// Vendor value stored when the lookup found nothing or failed
pub const VENDOR_NOT_FOUND: &str = "--none--";

/// Lease expiry value meaning "static / never expires"
pub const STATIC_LEASE: i64 = 0;

/// Vendor lookup service; the OUI prefix is appended as a path segment
pub const DEFAULT_VENDOR_URL: &str = "https://api.macvendors.com";

/// Display format for timestamps in listings and messages
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render seconds-since-epoch as local time.
pub fn render_timestamp(secs: i64) -> String {
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        None => secs.to_string(),
    }
}

/// Like `render_timestamp`, but the static sentinel reads "static lease".
pub fn render_expiry(secs: i64) -> String {
    if secs == STATIC_LEASE {
        "static lease".to_string()
    } else {
        render_timestamp(secs)
    }
}
