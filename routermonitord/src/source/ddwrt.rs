use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use regex::Regex;
use tokio::process::Command;
use shared::{ClientRecord, MacAddr};
use crate::config::DdWrtConfig;
use crate::error::SourceError;
use crate::source::{collect_snapshot, Snapshot};

/// Upper bound on the whole remote read, on top of ssh's connect timeout
const REMOTE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads the dnsmasq lease file from a DD-WRT router over ssh.
pub struct DdWrtSource {
    config: DdWrtConfig,
}

/// One line of a dnsmasq lease file:
/// `<expiry-epoch> <mac> <ip> <hostname> <client-id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdWrtLease {
    pub expiry: i64,
    pub mac: MacAddr,
    pub ip: String,
    pub hostname: String,
}

impl DdWrtLease {
    pub fn parse_line(line: &str) -> Option<Self> {
        static LINE_RE: OnceLock<Regex> = OnceLock::new();
        let re = LINE_RE.get_or_init(|| {
            Regex::new(r"^(\d+)\s+([0-9A-Fa-f:]+)\s+([\d.]+)\s+(\S+)(?:\s+\S+)?")
                .expect("valid lease line regex")
        });

        let caps = re.captures(line.trim())?;
        Some(Self {
            expiry: caps[1].parse().ok()?,
            mac: caps[2].parse().ok()?,
            ip: caps[3].to_string(),
            hostname: caps[4].to_string(),
        })
    }

    pub fn into_record(self) -> ClientRecord {
        // dnsmasq writes "*" when the client sent no hostname
        let hostname = if self.hostname == "*" {
            String::new()
        } else {
            self.hostname
        };
        ClientRecord {
            mac: self.mac,
            hostname,
            ip: self.ip,
            lease_expiry: self.expiry,
        }
    }
}

/// Malformed lines are logged and skipped
pub fn parse_lease_file(contents: &str) -> Snapshot {
    let records = contents.lines().filter_map(|line| {
        if line.trim().is_empty() {
            return None;
        }
        match DdWrtLease::parse_line(line) {
            Some(lease) => Some(lease.into_record()),
            None => {
                tracing::warn!("Skipping malformed lease line: {:?}", line);
                None
            }
        }
    });
    collect_snapshot(records)
}

impl DdWrtSource {
    pub fn new(config: DdWrtConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.ssh_command);
        cmd.arg(format!("{}@{}", self.config.user, self.config.host))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-T")
            .arg("cat")
            .arg(&self.config.lease_file)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    pub async fn fetch_clients(&self) -> Result<Snapshot, SourceError> {
        let output = tokio::time::timeout(REMOTE_READ_TIMEOUT, self.command().output())
            .await
            .map_err(|_| {
                SourceError::Remote(format!(
                    "reading {} from {} timed out",
                    self.config.lease_file, self.config.host
                ))
            })??;

        if !output.status.success() {
            return Err(SourceError::Remote(format!(
                "{} exited with {}: {}",
                self.config.ssh_command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_lease_file(&stdout))
    }
}
