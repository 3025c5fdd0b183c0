//! Rule resolution: matches request labels against a service's rate-limit
//! rules and derives the window key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use mesh_registry_core::model::rules::{
    MatchKind, RateLimitData, RateLimitRule, RegexSpread,
};

/// Compiled-regex cache shared across resolutions.
#[derive(Default)]
pub struct RegexCache {
    cache: Mutex<HashMap<String, Option<Arc<Regex>>>>,
}

impl RegexCache {
    pub fn get(&self, pattern: &str) -> Option<Arc<Regex>> {
        let mut cache = self.cache.lock();
        cache
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(compiled) => Some(Arc::new(compiled)),
                Err(err) => {
                    tracing::warn!(pattern, error = %err, "bad rate limit regex");
                    None
                }
            })
            .clone()
    }
}

/// A matched rule plus the canonical label key of its window.
pub struct ResolvedRule<'a> {
    pub rule: &'a RateLimitRule,
    pub label_key: String,
}

/// First active rule whose labels all match wins, in rule order.
pub fn resolve<'a>(
    data: &'a RateLimitData,
    labels: &HashMap<String, String>,
    regexes: &RegexCache,
) -> Option<ResolvedRule<'a>> {
    'next_rule: for rule in data.active_rules() {
        // (key, value-part-of-window-key) per matcher.
        let mut key_parts: Vec<(String, String)> = Vec::new();
        for (key, matcher) in &rule.labels {
            let Some(actual) = labels.get(key) else {
                continue 'next_rule;
            };
            match matcher.kind {
                MatchKind::Regex => {
                    let Some(compiled) = regexes.get(&matcher.value) else {
                        continue 'next_rule;
                    };
                    if !compiled.is_match(actual) {
                        continue 'next_rule;
                    }
                    let part = match rule.regex_spread {
                        // One window per observed value.
                        RegexSpread::Split => actual.clone(),
                        // One shared window for the whole expression.
                        RegexSpread::Combine => matcher.value.clone(),
                    };
                    key_parts.push((key.clone(), part));
                }
                _ => {
                    if &matcher.value != actual {
                        continue 'next_rule;
                    }
                    key_parts.push((key.clone(), actual.clone()));
                }
            }
        }
        key_parts.sort();
        let label_key = key_parts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("|");
        return Some(ResolvedRule { rule, label_key });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_registry_core::model::rules::{LimitAmount, MatchString};

    fn data() -> RateLimitData {
        RateLimitData {
            rules: vec![
                RateLimitRule {
                    id: "uin-split".to_string(),
                    labels: HashMap::from([(
                        "uin".to_string(),
                        MatchString::regex("[0-9]+"),
                    )]),
                    regex_spread: RegexSpread::Split,
                    amounts: vec![LimitAmount {
                        max_amount: 10,
                        duration_ms: 1000,
                    }],
                    ..Default::default()
                },
                RateLimitRule {
                    id: "label-combined".to_string(),
                    labels: HashMap::from([(
                        "label".to_string(),
                        MatchString::regex("v.*"),
                    )]),
                    amounts: vec![LimitAmount {
                        max_amount: 100,
                        duration_ms: 1000,
                    }],
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn split_regex_gets_per_value_windows() {
        let data = data();
        let regexes = RegexCache::default();
        let a = resolve(
            &data,
            &HashMap::from([("uin".to_string(), "1001".to_string())]),
            &regexes,
        )
        .unwrap();
        let b = resolve(
            &data,
            &HashMap::from([("uin".to_string(), "1002".to_string())]),
            &regexes,
        )
        .unwrap();
        assert_eq!(a.rule.id, "uin-split");
        assert_ne!(a.label_key, b.label_key);
    }

    #[test]
    fn combined_regex_shares_one_window() {
        let data = data();
        let regexes = RegexCache::default();
        let a = resolve(
            &data,
            &HashMap::from([("label".to_string(), "v1".to_string())]),
            &regexes,
        )
        .unwrap();
        let b = resolve(
            &data,
            &HashMap::from([("label".to_string(), "v2".to_string())]),
            &regexes,
        )
        .unwrap();
        assert_eq!(a.rule.id, "label-combined");
        assert_eq!(a.label_key, b.label_key);
    }

    #[test]
    fn missing_label_skips_the_rule() {
        let data = data();
        let regexes = RegexCache::default();
        assert!(resolve(
            &data,
            &HashMap::from([("other".to_string(), "x".to_string())]),
            &regexes,
        )
        .is_none());
    }

    #[test]
    fn disabled_rules_never_match() {
        let mut data = data();
        data.rules[0].disabled = true;
        let regexes = RegexCache::default();
        let resolved = resolve(
            &data,
            &HashMap::from([("uin".to_string(), "1001".to_string())]),
            &regexes,
        );
        assert!(resolved.is_none());
    }
}
