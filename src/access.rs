//! Request gating: one allow/block verdict per inbound request.
//!
//! Evaluation order is fixed: allowlist, threat score, unknown-country
//! policy, then the country mode. The first matching rule wins. Preview
//! mode computes and logs verdicts exactly as if blocking but never
//! actually denies.

use crate::config::{AllowlistEntry, Config, GateMode};
use crate::events::{EventLog, Severity};
use crate::geo::{GeoResolver, UNKNOWN_COUNTRY};
use crate::intel::ThreatAggregator;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    AllowlistIp,
    IntelScore(i64),
    GeoFailOpen,
    GeoFailClosed,
    GeoAllow,
    GeoNotInAllow,
    GeoDeny,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::AllowlistIp => f.write_str("allowlist-ip"),
            Reason::IntelScore(score) => write!(f, "intel-score-{}", score),
            Reason::GeoFailOpen => f.write_str("geo-fail-open"),
            Reason::GeoFailClosed => f.write_str("geo-fail-closed"),
            Reason::GeoAllow => f.write_str("geo-allow"),
            Reason::GeoNotInAllow => f.write_str("geo-not-in-allow"),
            Reason::GeoDeny => f.write_str("geo-deny"),
        }
    }
}

/// Verdict for one request. Computed fresh every time, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessVerdict {
    pub block: bool,
    pub reason: Reason,
    /// A would-block verdict downgraded to allow by preview mode.
    pub preview: bool,
}

impl AccessVerdict {
    fn allow(reason: Reason) -> Self {
        Self {
            block: false,
            reason,
            preview: false,
        }
    }

    fn block(reason: Reason) -> Self {
        Self {
            block: true,
            reason,
            preview: false,
        }
    }
}

/// The access decision engine.
pub struct AccessEngine {
    config: Arc<Config>,
    allowlist: Vec<AllowlistEntry>,
    geo: Arc<GeoResolver>,
    intel: Arc<ThreatAggregator>,
    log: Arc<EventLog>,
}

impl AccessEngine {
    pub fn new(
        config: Arc<Config>,
        geo: Arc<GeoResolver>,
        intel: Arc<ThreatAggregator>,
        log: Arc<EventLog>,
    ) -> Self {
        let allowlist = config.parse_allowlist();
        Self {
            config,
            allowlist,
            geo,
            intel,
            log,
        }
    }

    /// Request-scoped entry point: resolve the country, then decide.
    ///
    /// Returns `None` when the gate is disabled; admin and operator
    /// contexts simply never call this.
    pub async fn gate(&self, ip: &IpAddr, edge_hint: Option<&str>) -> Option<AccessVerdict> {
        if !self.config.settings.enabled {
            debug!("Gate disabled, request passed through");
            return None;
        }

        let country = self.geo.get_country(ip, edge_hint).await;
        Some(self.decide(ip, &country).await)
    }

    /// Decide for an IP whose country is already resolved. First matching
    /// rule wins.
    pub async fn decide(&self, ip: &IpAddr, country: &str) -> AccessVerdict {
        let verdict = self.evaluate(ip, country).await;

        if verdict.block {
            self.log_block(ip, country, &verdict);

            if self.config.settings.preview_only {
                info!(ip = %ip, reason = %verdict.reason, "Preview: request allowed");
                return AccessVerdict {
                    block: false,
                    reason: verdict.reason,
                    preview: true,
                };
            }
        }

        verdict
    }

    async fn evaluate(&self, ip: &IpAddr, country: &str) -> AccessVerdict {
        let settings = &self.config.settings;

        if self.allowlist.iter().any(|entry| entry.contains(ip)) {
            debug!(ip = %ip, "IP is allowlisted");
            return AccessVerdict::allow(Reason::AllowlistIp);
        }

        if settings.intel_enabled {
            let score = self.intel.score(ip).await;
            if score.score >= settings.intel_threshold {
                return AccessVerdict::block(Reason::IntelScore(score.score));
            }
        }

        if country == UNKNOWN_COUNTRY {
            return if settings.fail_open {
                AccessVerdict::allow(Reason::GeoFailOpen)
            } else {
                AccessVerdict::block(Reason::GeoFailClosed)
            };
        }

        let listed = settings.countries.iter().any(|c| c == country);
        match settings.mode {
            GateMode::Whitelist => {
                if listed {
                    AccessVerdict::allow(Reason::GeoAllow)
                } else {
                    AccessVerdict::block(Reason::GeoNotInAllow)
                }
            }
            GateMode::Blacklist => {
                if listed {
                    AccessVerdict::block(Reason::GeoDeny)
                } else {
                    AccessVerdict::allow(Reason::GeoAllow)
                }
            }
        }
    }

    fn log_block(&self, ip: &IpAddr, country: &str, verdict: &AccessVerdict) {
        let message = if self.config.settings.preview_only {
            format!(
                "preview: would block {} (country {}, reason {})",
                ip, country, verdict.reason
            )
        } else {
            format!(
                "blocked {} (country {}, reason {})",
                ip, country, verdict.reason
            )
        };

        if let Err(e) = self
            .log
            .append(&ip.to_string(), "", Severity::Warning, &message)
        {
            warn!(error = %e, "Event-log append failed");
        }
    }
}

/// Self-lockout protection for the country policy.
///
/// Saving a blacklist that names the operator's own (consensus-confident)
/// country would lock the operator out; the country is removed and a
/// correction notice returned for display.
pub fn sanitize_deny_countries(
    mode: GateMode,
    countries: &[String],
    own_country: Option<&str>,
) -> (Vec<String>, Option<String>) {
    let own = match (mode, own_country) {
        (GateMode::Blacklist, Some(own)) if own != UNKNOWN_COUNTRY => own.to_ascii_uppercase(),
        _ => return (countries.to_vec(), None),
    };

    if !countries.iter().any(|c| *c == own) {
        return (countries.to_vec(), None);
    }

    let kept: Vec<String> = countries.iter().filter(|c| **c != own).cloned().collect();
    let notice = format!(
        "Removed your own country {} from the blacklist to prevent lockout",
        own
    );
    (kept, Some(notice))
}
