use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use chrono::{Local, NaiveDateTime, TimeZone};
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use shared::protocol::STATIC_LEASE;
use shared::{ClientRecord, MacAddr};
use crate::config::PfsenseConfig;
use crate::error::SourceError;
use crate::source::{collect_snapshot, Snapshot};

/// One body row of the leases table, keyed by header text
pub type LeaseRow = BTreeMap<String, String>;

/// Reads the pfSense "DHCP leases" status page through its login form.
pub struct PfsenseSource {
    client: Client,
    config: PfsenseConfig,
}

impl PfsenseSource {
    pub fn new(config: PfsenseConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub async fn fetch_clients(&self) -> Result<Snapshot, SourceError> {
        let page = self.get_page().await?;
        let token = extract_csrf_token(&page)
            .ok_or_else(|| SourceError::Login("no CSRF token on the login page".to_string()))?;

        self.client
            .post(&self.config.url)
            .form(&[
                ("__csrf_magic", token.as_str()),
                ("login", "Login"),
                ("usernamefld", self.config.user.as_str()),
                ("passwordfld", self.config.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let page = self.get_page().await?;
        if is_login_page(&page) {
            return Err(SourceError::Login(format!(
                "credentials for {} were rejected",
                self.config.user
            )));
        }

        let rows = parse_lease_table(&page)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let lease = PfsenseLease::from_row(row);
            if let Some(record) = lease.into_record(&self.config.date_format)? {
                records.push(record);
            }
        }
        Ok(collect_snapshot(records))
    }

    async fn get_page(&self) -> Result<String, SourceError> {
        let body = self
            .client
            .get(&self.config.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

/// The typed subset of a leases-table row we care about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PfsenseLease {
    pub ip: String,
    pub mac: String,
    pub hostname: String,
    pub end: String,
}

impl PfsenseLease {
    /// Column positions move between pfSense releases, so fields are
    /// looked up by header name. Missing cells read as empty.
    pub fn from_row(row: &LeaseRow) -> Self {
        let cell = |name: &str| {
            row.iter()
                .find(|(header, _)| header.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        };
        Self {
            ip: cell("IP address"),
            mac: cell("MAC address"),
            hostname: cell("Hostname"),
            end: cell("End"),
        }
    }

    /// Ok(None) for a row without a usable MAC. An end time that doesn't
    /// match `date_format` is an error: it means the format is misconfigured.
    pub fn into_record(self, date_format: &str) -> Result<Option<ClientRecord>, SourceError> {
        let Some(mac) = find_mac(&self.mac) else {
            tracing::warn!("Skipping lease row without a valid MAC: {:?}", self);
            return Ok(None);
        };

        let end = self.end.trim();
        let lease_expiry = if end.is_empty() || end.eq_ignore_ascii_case("n/a") {
            STATIC_LEASE
        } else {
            parse_local_timestamp(end, date_format)?
        };

        Ok(Some(ClientRecord {
            mac,
            hostname: self.hostname,
            ip: self.ip,
            lease_expiry,
        }))
    }
}

fn parse_local_timestamp(value: &str, format: &str) -> Result<i64, SourceError> {
    let naive = NaiveDateTime::parse_from_str(value, format).map_err(|e| {
        SourceError::Parse(format!("lease end {:?} does not match {:?}: {}", value, format, e))
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| SourceError::Parse(format!("lease end {:?} is not a valid local time", value)))
}

/// The MAC cell may carry the vendor name after the address
fn find_mac(cell: &str) -> Option<MacAddr> {
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    let re = MAC_RE.get_or_init(|| {
        Regex::new(r"(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}").expect("valid MAC regex")
    });
    re.find(cell).and_then(|m| m.as_str().parse().ok())
}

pub fn extract_csrf_token(page: &str) -> Option<String> {
    static CSRF_RE: OnceLock<Regex> = OnceLock::new();
    let re = CSRF_RE.get_or_init(|| {
        Regex::new(r#"csrfMagicToken\s*=\s*"([^"]+)""#).expect("valid CSRF regex")
    });
    re.captures(page).map(|c| c[1].to_string())
}

fn is_login_page(page: &str) -> bool {
    page.contains("name=\"usernamefld\"") || page.contains("id=\"usernamefld\"")
}

/// Parse the leases table: the first row supplies column names (blank
/// headers become `None0`, `None1`, ...), body rows map positionally.
pub fn parse_lease_table(page: &str) -> Result<Vec<LeaseRow>, SourceError> {
    let document = Html::parse_document(page);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let body_row_sel = selector("tbody tr")?;
    let cell_sel = selector("th, td")?;

    let (table, header_row) = document
        .select(&table_sel)
        .filter_map(|table| table.select(&row_sel).next().map(|row| (table, row)))
        .find(|(_, row)| {
            row.select(&cell_sel)
                .any(|cell| cell_text(cell).eq_ignore_ascii_case("MAC address"))
        })
        .ok_or_else(|| SourceError::Parse("no leases table on the status page".to_string()))?;

    let mut none_index = 0;
    let headers: Vec<String> = header_row
        .select(&cell_sel)
        .map(|cell| {
            let text = cell_text(cell);
            if text.is_empty() {
                let name = format!("None{}", none_index);
                none_index += 1;
                name
            } else {
                text
            }
        })
        .collect();

    let rows = table
        .select(&body_row_sel)
        .filter(|row| row.id() != header_row.id())
        .map(|row| {
            let mut cells = row.select(&cell_sel).map(cell_text);
            headers
                .iter()
                .map(|header| (header.clone(), cells.next().unwrap_or_default()))
                .collect::<LeaseRow>()
        })
        .collect();

    Ok(rows)
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("bad selector {:?}: {}", css, e)))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"
        <html><head><script>var csrfMagicToken = "sid:abc123,1636300000;ip:def456,1636300000";var csrfMagicName = "__csrf_magic";</script></head>
        <body><form><input type="text" id="usernamefld" name="usernamefld"></form></body></html>
    "#;

    const LEASES_PAGE: &str = r#"
        <html><body><div><div></div><div><div></div><div>
        <table class="table">
          <thead>
            <tr><th></th><th>IP address</th><th>MAC address</th><th>Hostname</th>
                <th>Start</th><th>End</th><th>Online</th><th>Lease Type</th><th></th></tr>
          </thead>
          <tbody>
            <tr><td><i class="fa fa-arrow-up"></i></td><td>192.168.1.105</td>
                <td>00:0D:C5:5C:82:6D<br/><small>(Echostar)</small></td><td>Hopper-ETH0</td>
                <td>2021/11/07 09:51:44</td><td>2021/11/07 11:51:44</td><td>online</td><td>active</td><td></td></tr>
            <tr><td></td><td>192.168.1.2</td><td>b8:27:eb:00:00:01</td><td>nas</td>
                <td>n/a</td><td>n/a</td><td>online</td><td>static</td><td></td></tr>
            <tr><td></td><td>192.168.1.3</td><td>b8:27:eb:00:00:02</td></tr>
            <tr><td></td><td>192.168.1.4</td><td>not-a-mac</td><td>ghost</td>
                <td></td><td>n/a</td><td></td><td></td><td></td></tr>
          </tbody>
        </table>
        </div></div></div></body></html>
    "#;

    const FORMAT: &str = "%Y/%m/%d %H:%M:%S";

    #[test]
    fn test_extract_csrf_token() {
        assert_eq!(
            extract_csrf_token(LOGIN_PAGE).as_deref(),
            Some("sid:abc123,1636300000;ip:def456,1636300000")
        );
        assert_eq!(extract_csrf_token("<html></html>"), None);
        assert!(is_login_page(LOGIN_PAGE));
        assert!(!is_login_page(LEASES_PAGE));
    }

    #[test]
    fn test_headers_with_placeholders() {
        let rows = parse_lease_table(LEASES_PAGE).unwrap();
        assert_eq!(rows.len(), 4);

        let keys: Vec<_> = rows[0].keys().cloned().collect();
        assert!(keys.contains(&"None0".to_string()));
        assert!(keys.contains(&"None1".to_string()));
        assert_eq!(rows[0]["Hostname"], "Hopper-ETH0");
        assert_eq!(rows[0]["MAC address"], "00:0D:C5:5C:82:6D (Echostar)");
    }

    #[test]
    fn test_short_row_yields_empty_cells() {
        let rows = parse_lease_table(LEASES_PAGE).unwrap();
        assert_eq!(rows[2]["Hostname"], "");
        assert_eq!(rows[2]["End"], "");
    }

    #[test]
    fn test_rows_normalize_to_records() {
        let rows = parse_lease_table(LEASES_PAGE).unwrap();
        let records: Vec<ClientRecord> = rows
            .iter()
            .filter_map(|row| PfsenseLease::from_row(row).into_record(FORMAT).unwrap())
            .collect();

        // The row with a bogus MAC is skipped
        assert_eq!(records.len(), 3);

        let hopper = &records[0];
        assert_eq!(hopper.mac.to_string(), "00:0d:c5:5c:82:6d");
        assert_eq!(hopper.ip, "192.168.1.105");
        let expected = Local
            .from_local_datetime(&NaiveDateTime::parse_from_str("2021/11/07 11:51:44", FORMAT).unwrap())
            .earliest()
            .unwrap()
            .timestamp();
        assert_eq!(hopper.lease_expiry, expected);

        assert_eq!(records[1].hostname, "nas");
        assert_eq!(records[1].lease_expiry, STATIC_LEASE);

        assert_eq!(records[2].hostname, "");
        assert_eq!(records[2].lease_expiry, STATIC_LEASE);
    }

    #[test]
    fn test_wrong_date_format_is_an_error() {
        let rows = parse_lease_table(LEASES_PAGE).unwrap();
        let result = PfsenseLease::from_row(&rows[0]).into_record("%d.%m.%Y %H:%M");
        assert!(matches!(result, Err(SourceError::Parse(_))));
    }

    #[test]
    fn test_page_without_table_is_an_error() {
        assert!(matches!(parse_lease_table(LOGIN_PAGE), Err(SourceError::Parse(_))));
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let row: LeaseRow = [
            ("ip address".to_string(), "10.0.0.1".to_string()),
            ("MAC Address".to_string(), "aa:bb:cc:00:01:02".to_string()),
        ]
        .into_iter()
        .collect();
        let lease = PfsenseLease::from_row(&row);
        assert_eq!(lease.ip, "10.0.0.1");
        assert_eq!(lease.hostname, "");
    }
}
