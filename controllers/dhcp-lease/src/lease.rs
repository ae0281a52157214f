//! dnsmasq lease file model and parser.
//!
//! The lease file holds one lease per line with whitespace separated fields:
//!
//! ```text
//! <expiry epoch> <mac> <ip> <hostname> <client id>
//! ```
//!
//! Hostname and client id may be missing; dnsmasq writes `*` when unknown.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

/// One line of the dnsmasq lease file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub timestamp: u64,
    pub mac: String,
    pub ip: IpAddr,
    pub hostname: String,
    pub client_id: String,
}

impl LeaseRecord {
    /// Expiry as a UTC time. dnsmasq writes 0 for leases that never expire.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp == 0 {
            return None;
        }
        i64::try_from(self.timestamp)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

pub(crate) fn or_wildcard(field: &str) -> &str {
    if field.is_empty() { "*" } else { field }
}

/// A lease file line that could not be turned into a [`LeaseRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    /// 1-based line number
    pub line_number: usize,
    pub content: String,
    pub reason: String,
}

/// Result of parsing a lease file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLeases {
    /// Records in file order; a later line for the same IP supersedes an earlier one
    pub records: Vec<LeaseRecord>,
    pub rejected: Vec<RejectedLine>,
}

/// Parse raw lease file bytes.
///
/// Each line is decoded on its own. Malformed lines, including ones that are
/// not valid UTF-8, are collected in [`ParsedLeases::rejected`] and never stop
/// the remaining lines from being parsed. An empty file is an empty lease set.
pub fn parse_leases(bytes: &[u8]) -> ParsedLeases {
    let mut parsed = ParsedLeases::default();

    for (index, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let Ok(line) = std::str::from_utf8(raw) else {
            parsed.rejected.push(RejectedLine {
                line_number: index + 1,
                content: String::from_utf8_lossy(raw).into_owned(),
                reason: "not valid UTF-8".to_string(),
            });
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(record) => parsed.records.push(record),
            Err(reason) => parsed.rejected.push(RejectedLine {
                line_number: index + 1,
                content: line.to_string(),
                reason,
            }),
        }
    }

    parsed
}

fn parse_line(line: &str) -> Result<LeaseRecord, String> {
    let mut fields = line.split_whitespace();
    let (Some(timestamp), Some(mac), Some(ip)) = (fields.next(), fields.next(), fields.next()) else {
        return Err("expected at least timestamp, mac and ip".to_string());
    };

    let timestamp = timestamp
        .parse::<u64>()
        .map_err(|e| format!("invalid timestamp '{}': {}", timestamp, e))?;
    let ip = ip
        .parse::<IpAddr>()
        .map_err(|e| format!("invalid ip '{}': {}", ip, e))?;

    Ok(LeaseRecord {
        timestamp,
        mac: mac.to_string(),
        ip,
        hostname: fields.next().unwrap_or_default().to_string(),
        client_id: fields.next().unwrap_or_default().to_string(),
    })
}

/// Last known lease state, keyed by IP.
///
/// Owned by the lease sync task and handed to the reconciler by `&mut`; nothing
/// else reads or writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseMirror {
    leases: BTreeMap<IpAddr, LeaseRecord>,
}

impl LeaseMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&LeaseRecord> {
        self.leases.get(ip)
    }

    pub fn insert(&mut self, record: LeaseRecord) {
        self.leases.insert(record.ip, record);
    }

    pub fn remove(&mut self, ip: &IpAddr) -> Option<LeaseRecord> {
        self.leases.remove(ip)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn ips(&self) -> impl Iterator<Item = &IpAddr> {
        self.leases.keys()
    }
}

impl FromIterator<LeaseRecord> for LeaseMirror {
    fn from_iter<I: IntoIterator<Item = LeaseRecord>>(iter: I) -> Self {
        let mut mirror = Self::new();
        for record in iter {
            mirror.insert(record);
        }
        mirror
    }
}

/// Read the lease file, returning `None` when it does not exist.
pub async fn read_lease_file(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace the lease file in one step (write a sibling temp file, then rename).
///
/// Missing parent directories are created.
pub async fn write_lease_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
