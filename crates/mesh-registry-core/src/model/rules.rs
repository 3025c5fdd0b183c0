//! Rule payloads pushed by the control plane: routing rules, rate-limit
//! rules and per-service circuit-breaker overrides. All types are plain
//! data; regexes are compiled by the consuming plugin at match time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{MetadataFailover, ServiceKey};

/// How a rule value is compared against a request value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchKind {
    #[default]
    Exact,
    Regex,
    /// Bound from the caller's request metadata at match time.
    Parameter,
    /// Bound from a process environment variable at match time.
    Variable,
}

/// A single matcher value with its comparison kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchString {
    #[serde(default)]
    pub kind: MatchKind,
    pub value: String,
}

impl MatchString {
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            kind: MatchKind::Exact,
            value: value.into(),
        }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Self {
            kind: MatchKind::Regex,
            value: value.into(),
        }
    }
}

/// Source side of a route rule: an optional service identity plus metadata
/// matchers against the caller's request labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSource {
    #[serde(default)]
    pub service: Option<ServiceKey>,
    #[serde(default)]
    pub metadata: HashMap<String, MatchString>,
}

/// One destination subset of a route rule. Destinations are grouped by
/// priority (lower wins) and picked by weight within a priority.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDestination {
    #[serde(default)]
    pub metadata: HashMap<String, MatchString>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

/// A routing rule: any matching source admits the rule; destinations then
/// partition the instance set into subsets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRule {
    /// Rule id; together with the subset labels it keys the subset breaker.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sources: Vec<RuleSource>,
    #[serde(default)]
    pub destinations: Vec<RuleDestination>,
    /// Ends the chain with a redirect to another service.
    #[serde(default)]
    pub redirect: Option<ServiceKey>,
}

/// Routing payload of a service: rules applying to traffic into the
/// service (`inbounds`) and rules the service applies to its own outgoing
/// traffic (`outbounds`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRuleData {
    #[serde(default)]
    pub inbounds: Vec<RouteRule>,
    #[serde(default)]
    pub outbounds: Vec<RouteRule>,
}

/// Metadata-router request parameters.
#[derive(Debug, Clone, Default)]
pub struct MetadataRouterParam {
    pub metadata: HashMap<String, String>,
    pub failover: MetadataFailover,
}

/// One `(amount, duration)` budget of a rate-limit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitAmount {
    pub max_amount: u64,
    pub duration_ms: u64,
}

/// Local-only or cluster-reconciled limiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitMode {
    #[default]
    Local,
    Global,
}

/// How a regex label matcher spreads across observed label values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegexSpread {
    /// One shared window for every value matching the expression.
    #[default]
    Combine,
    /// A window per distinct matching value.
    Split,
}

/// Adaptive tuning bounds for a rule's amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClimbConfig {
    pub min_amount: u64,
    pub max_amount: u64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Error-rate above which the budget is tuned down.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// Slow-call-rate above which the budget is tuned down.
    #[serde(default = "default_slow_rate")]
    pub slow_rate: f64,
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_ms: u64,
}

fn default_sample_interval_ms() -> u64 {
    1000
}

fn default_error_rate() -> f64 {
    0.1
}

fn default_slow_rate() -> f64 {
    0.2
}

fn default_slow_call_ms() -> u64 {
    1000
}

/// One rate-limit rule of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, MatchString>,
    #[serde(default)]
    pub amounts: Vec<LimitAmount>,
    #[serde(default)]
    pub mode: LimitMode,
    #[serde(default)]
    pub cluster: Option<ServiceKey>,
    #[serde(default)]
    pub regex_spread: RegexSpread,
    #[serde(default)]
    pub climb: Option<ClimbConfig>,
    #[serde(default)]
    pub disabled: bool,
    /// Revision of the rule itself, independent of the snapshot revision.
    #[serde(default)]
    pub revision: String,
}

/// Rate-limit payload of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitData {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl RateLimitData {
    /// Rules ordered for matching; disabled rules are skipped.
    pub fn active_rules(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter().filter(|rule| !rule.disabled)
    }
}

/// Per-service overrides of the circuit-breaker plugin parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfigData {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub error_count: Option<ErrorCountOverride>,
    #[serde(default)]
    pub error_rate: Option<ErrorRateOverride>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCountOverride {
    pub continuous_threshold: u32,
    pub sleep_window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRateOverride {
    pub error_rate_threshold: f64,
    pub request_volume_threshold: u32,
    pub sleep_window_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_rule_yaml_round_trip() {
        let rule = RateLimitRule {
            id: "rule-1".to_string(),
            labels: HashMap::from([("label".to_string(), MatchString::regex("v.*"))]),
            amounts: vec![LimitAmount {
                max_amount: 100,
                duration_ms: 1000,
            }],
            mode: LimitMode::Local,
            cluster: None,
            regex_spread: RegexSpread::Combine,
            climb: None,
            disabled: false,
            revision: "r1".to_string(),
        };
        let text = serde_yaml::to_string(&rule).unwrap();
        let parsed: RateLimitRule = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.id, rule.id);
        assert_eq!(parsed.amounts, rule.amounts);
        assert_eq!(parsed.labels["label"], MatchString::regex("v.*"));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let data = RateLimitData {
            rules: vec![
                RateLimitRule {
                    id: "on".into(),
                    ..Default::default()
                },
                RateLimitRule {
                    id: "off".into(),
                    disabled: true,
                    ..Default::default()
                },
            ],
        };
        let ids: Vec<_> = data.active_rules().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["on"]);
    }
}
