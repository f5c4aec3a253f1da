//! Configuration types for the IP gate.
//!
//! One YAML file carries the gate policy, rotation policy, filesystem
//! paths, and the per-provider tables. `${VAR}` references are expanded
//! from the environment at load time.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Gate policy.
    #[serde(default)]
    pub settings: Settings,

    /// Event-log rotation and retention policy.
    #[serde(default)]
    pub rotation: RotationPolicy,

    /// Filesystem layout.
    #[serde(default)]
    pub paths: Paths,

    /// Geo consensus sources.
    #[serde(default)]
    pub geo: GeoConfig,

    /// Network-ownership resolver cascade.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Confidence-score reputation provider.
    #[serde(default)]
    pub abuseipdb: Option<AbuseIpDbConfig>,

    /// Detection-count reputation provider.
    #[serde(default)]
    pub virustotal: Option<VirusTotalConfig>,

    /// DNS blocklist provider.
    #[serde(default)]
    pub dnsbl: Option<DnsblConfig>,

    /// Community-intel provider (token-exchange auth).
    #[serde(default)]
    pub greynoise: Option<GreyNoiseConfig>,
}

/// Gate policy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Country evaluation mode.
    #[serde(default)]
    pub mode: GateMode,

    /// Country list: denied countries in blacklist mode, allowed countries
    /// in whitelist mode. Two-letter codes.
    #[serde(default)]
    pub countries: Vec<String>,

    /// IPs and CIDRs that bypass every check.
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Allow requests whose country cannot be determined.
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Compute and log verdicts without actually denying anything.
    #[serde(default)]
    pub preview_only: bool,

    /// Gate on the aggregated threat score.
    #[serde(default = "default_true")]
    pub intel_enabled: bool,

    /// Block when the aggregated score reaches this value.
    #[serde(default = "default_intel_threshold")]
    pub intel_threshold: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: GateMode::default(),
            countries: Vec::new(),
            allowlist: Vec::new(),
            fail_open: true,
            preview_only: false,
            intel_enabled: true,
            intel_threshold: default_intel_threshold(),
        }
    }
}

/// Country evaluation mode.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    /// Block listed countries, allow the rest.
    #[default]
    Blacklist,
    /// Allow listed countries, block the rest.
    Whitelist,
}

/// Event-log rotation and retention policy, read on every rotation run.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the active log exceeds this size.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Keep at most this many archives, newest first.
    #[serde(default = "default_max_archive_count")]
    pub max_archive_count: usize,

    /// Drop entries older than this many days.
    #[serde(default = "default_max_retention_days")]
    pub max_retention_days: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            max_archive_count: default_max_archive_count(),
            max_retention_days: default_max_retention_days(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Paths {
    /// Active event log.
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,

    /// Directory holding rotated archives.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Enrichment cache persistence file. Absent = in-memory only.
    #[serde(default = "default_cache_file")]
    pub cache_file: Option<PathBuf>,

    /// Operator deny file: one CIDR per line, written by `block`.
    #[serde(default = "default_deny_file")]
    pub deny_file: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            event_log: default_event_log(),
            archive_dir: default_archive_dir(),
            cache_file: default_cache_file(),
            deny_file: default_deny_file(),
        }
    }
}

/// Geo consensus source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeoConfig {
    /// Request header carrying the edge network's country verdict.
    #[serde(default = "default_edge_header")]
    pub edge_header: String,

    #[serde(default = "default_true")]
    pub ipapi_enabled: bool,

    #[serde(default = "default_ipapi_url")]
    pub ipapi_url: String,

    #[serde(default = "default_true")]
    pub ipwhois_enabled: bool,

    #[serde(default = "default_ipwhois_url")]
    pub ipwhois_url: String,

    /// Per-source request timeout.
    #[serde(default = "default_geo_timeout")]
    pub timeout_ms: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            edge_header: default_edge_header(),
            ipapi_enabled: true,
            ipapi_url: default_ipapi_url(),
            ipwhois_enabled: true,
            ipwhois_url: default_ipwhois_url(),
            timeout_ms: default_geo_timeout(),
        }
    }
}

/// Network-ownership resolver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// BGP route server, host:port line protocol.
    #[serde(default = "default_bgp_host")]
    pub bgp_host: String,

    #[serde(default = "default_pool_timeout")]
    pub bgp_timeout_ms: u64,

    /// RDAP anchor; the IP is appended as a path segment.
    #[serde(default = "default_rdap_url")]
    pub rdap_url: String,

    #[serde(default = "default_pool_timeout")]
    pub rdap_timeout_ms: u64,

    /// Regional-registry structured search endpoint.
    #[serde(default = "default_ripe_search_url")]
    pub ripe_search_url: String,

    #[serde(default = "default_pool_timeout")]
    pub ripe_timeout_ms: u64,

    /// Port-43 WHOIS fallback, host:port.
    #[serde(default = "default_whois_host")]
    pub whois_host: String,

    #[serde(default = "default_pool_timeout")]
    pub whois_timeout_ms: u64,

    /// Per-layer result cache TTL.
    #[serde(default = "default_pool_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bgp_host: default_bgp_host(),
            bgp_timeout_ms: default_pool_timeout(),
            rdap_url: default_rdap_url(),
            rdap_timeout_ms: default_pool_timeout(),
            ripe_search_url: default_ripe_search_url(),
            ripe_timeout_ms: default_pool_timeout(),
            whois_host: default_whois_host(),
            whois_timeout_ms: default_pool_timeout(),
            cache_ttl_seconds: default_pool_cache_ttl(),
        }
    }
}

/// AbuseIPDB provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbuseIpDbConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API key (supports ${ENV_VAR} syntax).
    pub api_key: String,

    #[serde(default = "default_check_url")]
    pub url: String,

    /// Only consider reports from the last N days.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    #[serde(default = "default_intel_timeout")]
    pub timeout_ms: u64,
}

/// VirusTotal provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VirusTotalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API key (supports ${ENV_VAR} syntax).
    pub api_key: String,

    #[serde(default = "default_vt_url")]
    pub url: String,

    #[serde(default = "default_intel_timeout")]
    pub timeout_ms: u64,
}

/// DNSBL provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsblConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Blocklist zone queried with reversed octets.
    #[serde(default = "default_dnsbl_zone")]
    pub zone: String,
}

/// Community-intel provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GreyNoiseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API key exchanged for a short-lived bearer token.
    pub api_key: String,

    /// Token-exchange endpoint.
    #[serde(default = "default_gn_auth_url")]
    pub auth_url: String,

    /// Per-IP context endpoint; the IP is appended as a path segment.
    #[serde(default = "default_gn_api_url")]
    pub api_url: String,

    /// Bearer token reuse window.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,

    #[serde(default = "default_intel_timeout")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_intel_threshold() -> i64 {
    80
}

fn default_max_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_archive_count() -> usize {
    5
}

fn default_max_retention_days() -> u32 {
    30
}

fn default_event_log() -> PathBuf {
    PathBuf::from("data/events.log")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/archive")
}

fn default_cache_file() -> Option<PathBuf> {
    Some(PathBuf::from("data/cache.json"))
}

fn default_deny_file() -> PathBuf {
    PathBuf::from("data/deny.txt")
}

fn default_edge_header() -> String {
    "cf-ipcountry".to_string()
}

fn default_ipapi_url() -> String {
    "http://ip-api.com/json".to_string()
}

fn default_ipwhois_url() -> String {
    "https://ipwho.is".to_string()
}

fn default_geo_timeout() -> u64 {
    6000
}

fn default_bgp_host() -> String {
    "whois.cymru.com:43".to_string()
}

fn default_rdap_url() -> String {
    "https://rdap.org/ip".to_string()
}

fn default_ripe_search_url() -> String {
    "https://rest.db.ripe.net/search.json".to_string()
}

fn default_whois_host() -> String {
    "whois.ripe.net:43".to_string()
}

fn default_pool_timeout() -> u64 {
    6000
}

fn default_pool_cache_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_check_url() -> String {
    "https://api.abuseipdb.com/api/v2/check".to_string()
}

fn default_max_age_days() -> u32 {
    90
}

fn default_intel_timeout() -> u64 {
    5000
}

fn default_vt_url() -> String {
    "https://www.virustotal.com/api/v3/ip_addresses".to_string()
}

fn default_dnsbl_zone() -> String {
    "zen.spamhaus.org".to_string()
}

fn default_gn_auth_url() -> String {
    "https://api.greynoise.io/v1/auth".to_string()
}

fn default_gn_api_url() -> String {
    "https://api.greynoise.io/v3/community".to_string()
}

fn default_token_ttl() -> u64 {
    23 * 3600
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Uppercase country codes so later comparisons are exact.
    pub fn normalize(&mut self) {
        for code in &mut self.settings.countries {
            *code = code.trim().to_ascii_uppercase();
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for code in &self.settings.countries {
            if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
                anyhow::bail!("Invalid country code: {}", code);
            }
        }

        for entry in &self.settings.allowlist {
            if entry.parse::<IpAddr>().is_err() && entry.parse::<IpNet>().is_err() {
                anyhow::bail!("Invalid allowlist entry: {}", entry);
            }
        }

        if !(0..=150).contains(&self.settings.intel_threshold) {
            anyhow::bail!(
                "intel_threshold ({}) must be within 0..=150",
                self.settings.intel_threshold
            );
        }

        if self.rotation.max_size_bytes == 0 {
            anyhow::bail!("rotation.max_size_bytes must be positive");
        }

        if let Some(ref abuseipdb) = self.abuseipdb {
            if abuseipdb.enabled && abuseipdb.api_key.is_empty() {
                anyhow::bail!("AbuseIPDB is enabled but api_key is empty");
            }
        }

        if let Some(ref virustotal) = self.virustotal {
            if virustotal.enabled && virustotal.api_key.is_empty() {
                anyhow::bail!("VirusTotal is enabled but api_key is empty");
            }
        }

        if let Some(ref greynoise) = self.greynoise {
            if greynoise.enabled && greynoise.api_key.is_empty() {
                anyhow::bail!("GreyNoise is enabled but api_key is empty");
            }
        }

        Ok(())
    }

    /// Persist configuration atomically (write-then-rename).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, yaml)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Parse allowlist entries into IpAddr or IpNet.
    pub fn parse_allowlist(&self) -> Vec<AllowlistEntry> {
        self.settings
            .allowlist
            .iter()
            .filter_map(|s| {
                if let Ok(ip) = s.parse::<IpAddr>() {
                    Some(AllowlistEntry::Single(ip))
                } else if let Ok(net) = s.parse::<IpNet>() {
                    Some(AllowlistEntry::Network(net))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# IP gate configuration

settings:
  enabled: true
  mode: blacklist              # blacklist or whitelist
  countries: []                # denied (blacklist) or allowed (whitelist)
  allowlist:                   # bypass all checks
    - "127.0.0.1"
    - "10.0.0.0/8"
  fail_open: true              # allow when country is unknown
  preview_only: false          # log verdicts without denying
  intel_enabled: true
  intel_threshold: 80          # block at aggregated score >= 80

rotation:
  max_size_bytes: 10485760     # rotate past 10 MiB
  max_archive_count: 5
  max_retention_days: 30

paths:
  event_log: "data/events.log"
  archive_dir: "data/archive"
  cache_file: "data/cache.json"
  deny_file: "data/deny.txt"

geo:
  edge_header: "cf-ipcountry"
  ipapi_enabled: true
  ipwhois_enabled: true
  timeout_ms: 6000

pool:
  bgp_host: "whois.cymru.com:43"
  rdap_url: "https://rdap.org/ip"
  ripe_search_url: "https://rest.db.ripe.net/search.json"
  whois_host: "whois.ripe.net:43"
  cache_ttl_seconds: 604800    # 7 days per resolver layer

# Reputation providers - each optional, skipped when absent
abuseipdb:
  enabled: true
  api_key: "${ABUSEIPDB_API_KEY}"
  max_age_days: 90
  timeout_ms: 5000

virustotal:
  enabled: true
  api_key: "${VT_API_KEY}"
  timeout_ms: 5000

dnsbl:
  enabled: true
  zone: "zen.spamhaus.org"

greynoise:
  enabled: true
  api_key: "${GREYNOISE_API_KEY}"
  token_ttl_seconds: 82800     # re-exchange the bearer token after ~23h
  timeout_ms: 5000
"#
        .to_string()
    }
}

/// Parsed allowlist entry.
#[derive(Debug, Clone)]
pub enum AllowlistEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl AllowlistEntry {
    /// Check if an IP address matches this allowlist entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            AllowlistEntry::Single(allowed) => allowed == ip,
            AllowlistEntry::Network(net) => net.contains(ip),
        }
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern");

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.enabled);
        assert_eq!(settings.mode, GateMode::Blacklist);
        assert!(settings.fail_open);
        assert!(!settings.preview_only);
        assert_eq!(settings.intel_threshold, 80);
    }

    #[test]
    fn test_default_rotation_policy() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.max_size_bytes, 10 * 1024 * 1024);
        assert_eq!(policy.max_archive_count, 5);
        assert_eq!(policy.max_retention_days, 30);
    }

    #[test]
    fn test_parse_config_yaml() {
        let yaml = r#"
settings:
  enabled: true
  mode: whitelist
  countries: ["ua", "PL"]
  fail_open: false
  intel_threshold: 90

rotation:
  max_size_bytes: 1024
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.normalize();

        assert_eq!(config.settings.mode, GateMode::Whitelist);
        assert_eq!(config.settings.countries, vec!["UA", "PL"]);
        assert!(!config.settings.fail_open);
        assert_eq!(config.settings.intel_threshold, 90);
        assert_eq!(config.rotation.max_size_bytes, 1024);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.rotation.max_archive_count, 5);
        assert!(config.abuseipdb.is_none());
    }

    #[test]
    fn test_validate_country_codes() {
        let mut config = Config::default();
        config.settings.countries = vec!["UAX".to_string()];
        assert!(config.validate().is_err());

        config.settings.countries = vec!["UA".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_allowlist() {
        let mut config = Config::default();
        config.settings.allowlist = vec!["not-an-ip".to_string()];
        assert!(config.validate().is_err());

        config.settings.allowlist = vec!["10.0.0.0/8".to_string(), "::1".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_threshold_range() {
        let mut config = Config::default();
        config.settings.intel_threshold = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_api_keys() {
        let mut config = Config::default();
        config.abuseipdb = Some(AbuseIpDbConfig {
            enabled: true,
            api_key: String::new(),
            url: default_check_url(),
            max_age_days: 90,
            timeout_ms: 5000,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_allowlist_entries() {
        let mut config = Config::default();
        config.settings.allowlist = vec![
            "127.0.0.1".to_string(),
            "10.0.0.0/8".to_string(),
            "garbage".to_string(),
        ];

        let entries = config.parse_allowlist();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains(&"127.0.0.1".parse().unwrap()));
        assert!(entries[1].contains(&"10.1.2.3".parse().unwrap()));
        assert!(!entries[1].contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("IPGATE_TEST_KEY", "secret123");
        let input = "api_key: \"${IPGATE_TEST_KEY}\"";
        assert_eq!(expand_env_vars(input), "api_key: \"secret123\"");
        std::env::remove_var("IPGATE_TEST_KEY");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let input = "api_key: \"${IPGATE_NONEXISTENT_VAR}\"";
        assert_eq!(expand_env_vars(input), "api_key: \"\"");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.settings.countries = vec!["RU".to_string()];
        config.settings.mode = GateMode::Blacklist;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.settings.countries, vec!["RU"]);
        assert_eq!(loaded.settings.mode, GateMode::Blacklist);
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(&Config::example()).unwrap();
        assert!(config.settings.enabled);
        assert!(config.settings.fail_open);
        assert!(config.abuseipdb.is_some());
        assert!(config.greynoise.is_some());
        assert_eq!(config.pool.cache_ttl_seconds, 604800);
    }
}
