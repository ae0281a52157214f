//! Controller configuration.
//!
//! Two sources feed the controller:
//! - environment variables (paths, namespace, timeouts), read once at startup
//! - the dnsmasq configuration file, from which the `dhcp-range` directives
//!   are loaded as [`AddressRange`]s

use crate::error::ControllerError;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// dnsmasq directive declaring an address range
const RANGE_DIRECTIVE: &str = "dhcp-range";

/// An address range served by dnsmasq, optionally scoped to a VLAN tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub vlan: Option<String>,
}

impl AddressRange {
    /// Whether `ip` lies within the range (both ends inclusive).
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let ip = u32::from(*v4);
                u32::from(self.start) <= ip && ip <= u32::from(self.end)
            }
            IpAddr::V6(_) => false,
        }
    }

    /// VLAN tag of the range, empty when untagged.
    pub fn vlan_tag(&self) -> &str {
        self.vlan.as_deref().unwrap_or("")
    }
}

/// VLAN tag of the first range containing `ip`, empty when none does.
pub fn vlan_for<'a>(ranges: &'a [AddressRange], ip: &IpAddr) -> &'a str {
    ranges
        .iter()
        .find(|range| range.contains(ip))
        .map_or("", AddressRange::vlan_tag)
}

/// Load the `dhcp-range` directives from a dnsmasq configuration file.
///
/// An unreadable file is fatal; malformed directives are skipped.
pub fn load_ranges(path: &Path) -> Result<Vec<AddressRange>, ControllerError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ControllerError::ConfigUnreadable {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_ranges(&contents))
}

/// Parse every `dhcp-range` directive in `contents`.
pub fn parse_ranges(contents: &str) -> Vec<AddressRange> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let range = parse_range_line(line);
            if range.is_none() && line.contains(RANGE_DIRECTIVE) {
                debug!("Skipping unusable dhcp-range on line {}: {}", index + 1, line.trim());
            }
            range
        })
        .collect()
}

/// Parse one configuration line.
///
/// Tokens are split on commas, spaces and equals signs. After the directive,
/// a leading token that is not an IP address is taken as the VLAN tag when at
/// least two more tokens follow; the next two tokens are the start and end
/// addresses. Anything after them (netmask, lease time) is ignored.
fn parse_range_line(line: &str) -> Option<AddressRange> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let tokens: Vec<&str> = line
        .split(|c: char| c == ',' || c == '=' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .collect();
    let directive = tokens
        .iter()
        .position(|token| token.trim_start_matches('-') == RANGE_DIRECTIVE)?;
    let args = &tokens[directive + 1..];

    let (vlan, addresses) = match args {
        [first, rest @ ..] if rest.len() >= 2 && first.parse::<IpAddr>().is_err() => {
            (Some(strip_tag_prefix(first).to_string()), rest)
        }
        _ => (None, args),
    };

    match addresses {
        [start, end, ..] => Some(AddressRange {
            start: start.parse().ok()?,
            end: end.parse().ok()?,
            vlan,
        }),
        _ => None,
    }
}

fn strip_tag_prefix(tag: &str) -> &str {
    tag.strip_prefix("set:")
        .or_else(|| tag.strip_prefix("tag:"))
        .unwrap_or(tag)
}

/// Runtime settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// dnsmasq executable (`DNSMASQ_BINARY`)
    pub dnsmasq_binary: PathBuf,
    /// Directory passed to `--conf-dir` (`DNSMASQ_CONF_DIR`)
    pub conf_dir: PathBuf,
    /// File holding the `dhcp-range` directives (`DNSMASQ_CONFIG_FILE`)
    pub config_file: PathBuf,
    /// File passed to `--log-facility` (`DNSMASQ_LOG_FILE`)
    pub log_file: PathBuf,
    /// dnsmasq lease file (`LEASE_FILE`)
    pub lease_file: PathBuf,
    /// Namespace of DhcpLease objects and watched pods (`WATCH_NAMESPACE`)
    pub namespace: String,
    /// Optional label selector for watched pods (`ENTITY_LABEL_SELECTOR`)
    pub entity_label_selector: Option<String>,
    /// Bound on every store call (`STORE_TIMEOUT_SECS`)
    pub store_timeout: Duration,
    /// Time dnsmasq gets to exit after SIGTERM (`STOP_GRACE_MS`)
    pub stop_grace: Duration,
    /// Pause between a detected change and reading the lease file (`SETTLE_DELAY_MS`)
    pub settle_delay: Duration,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through `lookup`, applying defaults for absent keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let conf_dir = PathBuf::from(lookup("DNSMASQ_CONF_DIR").unwrap_or_else(|| "/etc/dnsmasq.d".to_string()));
        let config_file = lookup("DNSMASQ_CONFIG_FILE")
            .map_or_else(|| conf_dir.join("dhcp.conf"), PathBuf::from);

        Ok(Self {
            dnsmasq_binary: PathBuf::from(lookup("DNSMASQ_BINARY").unwrap_or_else(|| "dnsmasq".to_string())),
            conf_dir,
            config_file,
            log_file: PathBuf::from(lookup("DNSMASQ_LOG_FILE").unwrap_or_else(|| "/var/log/dnsmasq.log".to_string())),
            lease_file: PathBuf::from(lookup("LEASE_FILE").unwrap_or_else(|| "/var/lib/misc/dnsmasq.leases".to_string())),
            namespace: lookup("WATCH_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            entity_label_selector: lookup("ENTITY_LABEL_SELECTOR").filter(|s| !s.trim().is_empty()),
            store_timeout: Duration::from_secs(parse_number(&lookup, "STORE_TIMEOUT_SECS", 5)?),
            stop_grace: Duration::from_millis(parse_number(&lookup, "STOP_GRACE_MS", 1000)?),
            settle_delay: Duration::from_millis(parse_number(&lookup, "SETTLE_DELAY_MS", 100)?),
        })
    }
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64, ControllerError> {
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{} must be a non-negative integer, got '{}': {}", key, value, e))
        }),
        None => Ok(default),
    }
}
