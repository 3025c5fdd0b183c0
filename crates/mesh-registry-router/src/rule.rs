//! Rule router: matches the caller against the destination's inbound rules
//! (or the source service's outbound rules) and narrows to a destination
//! subset.
//!
//! Destinations group by priority, lower first; within a priority one
//! subset is picked by weight. A priority whose subsets have no selectable
//! instance, or sit in subset-open state, fails over to the next priority.
//! Preserved subsets stay available but only when nothing healthier exists
//! at that priority.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;

use mesh_registry_core::model::rules::{
    MatchKind, MatchString, RouteRule, RuleDestination, RuleSource,
};
use mesh_registry_core::{
    Instance, InstancesSet, RegistryError, Result, ReturnCode, SubsetStateView,
};

use crate::{RouteAction, RouteInfo, ServiceRouter};

pub struct RuleRouter {
    regex_cache: Mutex<HashMap<String, Arc<Regex>>>,
}

impl Default for RuleRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleRouter {
    pub const NAME: &'static str = "ruleBasedRouter";

    pub fn new() -> Self {
        Self {
            regex_cache: Mutex::new(HashMap::new()),
        }
    }

    fn compiled(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Some(found) = self.regex_cache.lock().get(pattern) {
            return Ok(found.clone());
        }
        let compiled = Regex::new(pattern).map_err(|err| {
            RegistryError::with_detail(ReturnCode::InvalidRouteRule, err.to_string())
        })?;
        let compiled = Arc::new(compiled);
        self.regex_cache
            .lock()
            .insert(pattern.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Evaluates one matcher against an actual value. `Parameter` binds the
    /// expected value from the caller's metadata, `Variable` from the
    /// process environment; both use the matcher value (stripped of the
    /// `$` prefix) as the lookup key, falling back to the matched key.
    fn match_value(
        &self,
        key: &str,
        matcher: &MatchString,
        actual: &str,
        caller_metadata: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        match matcher.kind {
            MatchKind::Exact => Ok(matcher.value == actual),
            MatchKind::Regex => Ok(self.compiled(&matcher.value)?.is_match(actual)),
            MatchKind::Parameter => {
                let lookup = matcher.value.strip_prefix('$').unwrap_or(key);
                let lookup = if lookup.is_empty() { key } else { lookup };
                Ok(caller_metadata
                    .and_then(|meta| meta.get(lookup))
                    .is_some_and(|expected| expected == actual))
            }
            MatchKind::Variable => {
                let lookup = matcher.value.strip_prefix('$').unwrap_or(&matcher.value);
                Ok(std::env::var(lookup).map(|expected| expected == actual).unwrap_or(false))
            }
        }
    }

    fn source_matches(&self, info: &RouteInfo, source: &RuleSource) -> Result<bool> {
        if let Some(service) = &source.service {
            let caller_key = info.source.as_ref().and_then(|s| s.service_key.as_ref());
            let wildcard = service.namespace == "*" && service.name == "*";
            if !wildcard && caller_key != Some(service) {
                return Ok(false);
            }
        }
        let caller_metadata = info.source.as_ref().map(|s| &s.metadata);
        for (key, matcher) in &source.metadata {
            let Some(actual) = caller_metadata.and_then(|meta| meta.get(key)) else {
                return Ok(false);
            };
            if !self.match_value(key, matcher, actual, caller_metadata)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn rule_matches(&self, info: &RouteInfo, rule: &RouteRule) -> Result<bool> {
        if rule.sources.is_empty() {
            return Ok(true);
        }
        for source in &rule.sources {
            if self.source_matches(info, source)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn subset_instances(
        &self,
        info: &RouteInfo,
        destination: &RuleDestination,
    ) -> Result<Vec<Arc<Instance>>> {
        let caller_metadata = info.source.as_ref().map(|s| &s.metadata);
        let mut out = Vec::new();
        'next_instance: for instance in info.instances.available().instances() {
            for (key, matcher) in &destination.metadata {
                let Some(actual) = instance.metadata().get(key) else {
                    continue 'next_instance;
                };
                if !self.match_value(key, matcher, actual, caller_metadata)? {
                    continue 'next_instance;
                }
            }
            out.push(instance.clone());
        }
        Ok(out)
    }

    fn subset_labels(destination: &RuleDestination) -> BTreeMap<String, String> {
        destination
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    fn subset_state_key(labels: &BTreeMap<String, String>, rule_id: &str) -> String {
        let mut out = String::new();
        for (k, v) in labels {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out.push('#');
        out.push_str(rule_id);
        out
    }

    /// Applies one matched rule. Walks priorities low to high; the first
    /// priority with a usable subset wins.
    fn apply_rule(&self, info: &mut RouteInfo, rule: &RouteRule) -> Result<bool> {
        let subset_view = info.instances.service().subset_view();
        let circuit = info.instances.circuit();

        let mut by_priority: BTreeMap<u32, Vec<&RuleDestination>> = BTreeMap::new();
        for destination in &rule.destinations {
            by_priority.entry(destination.priority).or_default().push(destination);
        }

        for (_priority, destinations) in by_priority {
            // (weight, instances, labels) per usable subset.
            let mut usable: Vec<(u32, Vec<Arc<Instance>>, BTreeMap<String, String>)> = Vec::new();
            let mut preserved: Vec<(u32, Vec<Arc<Instance>>, BTreeMap<String, String>)> =
                Vec::new();
            for destination in destinations {
                let members = self.subset_instances(info, destination)?;
                if members.is_empty() {
                    continue;
                }
                let labels = Self::subset_labels(destination);
                let state_key = Self::subset_state_key(&labels, &rule.id);
                if !info.include_circuit_broken && is_subset_open(&subset_view, &state_key) {
                    continue;
                }
                let selectable = members
                    .iter()
                    .filter(|inst| info.is_selectable(inst, &circuit))
                    .count();
                if selectable == 0 {
                    continue;
                }
                if subset_view.preserved.contains(&state_key) {
                    preserved.push((destination.weight, members, labels));
                } else {
                    usable.push((destination.weight, members, labels));
                }
            }
            let pool = if !usable.is_empty() { usable } else { preserved };
            if pool.is_empty() {
                continue;
            }
            let chosen = pick_weighted(pool);
            let (_, members, labels) = chosen;
            let discarded = info
                .instances
                .available()
                .instances()
                .iter()
                .filter(|inst| !members.iter().any(|kept| kept.id() == inst.id()))
                .map(|inst| inst.id().to_string())
                .collect();
            info.instances
                .narrow(Arc::new(InstancesSet::with_subset(members, labels)));
            info.record_stat(Self::NAME, "destination subset", discarded);
            return Ok(true);
        }
        Ok(false)
    }
}

fn is_subset_open(view: &SubsetStateView, state_key: &str) -> bool {
    view.open.contains(state_key)
}

fn pick_weighted(
    mut pool: Vec<(u32, Vec<Arc<Instance>>, BTreeMap<String, String>)>,
) -> (u32, Vec<Arc<Instance>>, BTreeMap<String, String>) {
    if pool.len() == 1 {
        return pool.remove(0);
    }
    let total: u64 = pool.iter().map(|(w, _, _)| u64::from(*w).max(1)).sum();
    let mut roll = rand::rng().random_range(0..total);
    let mut index = pool.len() - 1;
    for (i, (weight, _, _)) in pool.iter().enumerate() {
        let weight = u64::from(*weight).max(1);
        if roll < weight {
            index = i;
            break;
        }
        roll -= weight;
    }
    pool.swap_remove(index)
}

impl ServiceRouter for RuleRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn route(&self, info: &mut RouteInfo) -> Result<RouteAction> {
        // Inbound rules of the destination win over the caller's outbounds.
        let dest_rules: Vec<RouteRule> = info
            .dest_route_rule
            .as_ref()
            .and_then(|data| data.route_rule())
            .map(|data| data.inbounds.clone())
            .unwrap_or_default();
        let source_rules: Vec<RouteRule> = info
            .source_route_rule
            .as_ref()
            .and_then(|data| data.route_rule())
            .map(|data| data.outbounds.clone())
            .unwrap_or_default();
        let rules = if !dest_rules.is_empty() {
            dest_rules
        } else {
            source_rules
        };
        if rules.is_empty() {
            return Ok(RouteAction::Continue);
        }

        for rule in &rules {
            if !self.rule_matches(info, rule)? {
                continue;
            }
            if let Some(target) = &rule.redirect {
                return Ok(RouteAction::Redirect(target.clone()));
            }
            if rule.destinations.is_empty() {
                return Ok(RouteAction::Continue);
            }
            if self.apply_rule(info, rule)? {
                return Ok(RouteAction::Continue);
            }
            return Err(RegistryError::with_detail(
                ReturnCode::RouteRuleNotMatch,
                format!("no destination subset usable for {}", info.dest_key),
            ));
        }
        Err(RegistryError::with_detail(
            ReturnCode::RouteRuleNotMatch,
            format!("no rule matched the caller for {}", info.dest_key),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use mesh_registry_core::model::rules::RouteRuleData;
    use mesh_registry_core::{
        DataKind, DataPayload, DataStatus, ServiceData, ServiceInfo, ServiceKey,
    };

    fn route_rule_data(rules: Vec<RouteRule>, inbound: bool) -> Arc<ServiceData> {
        let data = if inbound {
            RouteRuleData {
                inbounds: rules,
                outbounds: Vec::new(),
            }
        } else {
            RouteRuleData {
                inbounds: Vec::new(),
                outbounds: rules,
            }
        };
        Arc::new(ServiceData::new(
            ServiceKey::new("Test", "echo"),
            DataKind::RouteRule,
            "r1",
            DataStatus::Syncing,
            DataPayload::RouteRule(data),
        ))
    }

    fn dest(pairs: &[(&str, &str)], priority: u32, weight: u32) -> RuleDestination {
        RuleDestination {
            metadata: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), MatchString::exact(*v)))
                .collect(),
            priority,
            weight,
        }
    }

    #[test]
    fn no_rules_passes_through() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![inst("a", true)]);
        assert!(matches!(
            router.route(&mut info).unwrap(),
            RouteAction::Continue
        ));
        assert_eq!(ids(&info), vec!["a"]);
    }

    #[test]
    fn destination_subset_narrows() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![
            inst_meta("a", true, &[("env", "base")]),
            inst_meta("b", true, &[("env", "feature")]),
        ]);
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: Vec::new(),
            destinations: vec![dest(&[("env", "base")], 0, 100)],
            redirect: None,
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["a"]);
        assert_eq!(info.instances.available().subset_labels().get("env"), Some(&"base".to_string()));
    }

    #[test]
    fn priority_failover_skips_dead_subset() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![
            inst_meta("a", false, &[("tier", "gold")]),
            inst_meta("b", true, &[("tier", "silver")]),
        ]);
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: Vec::new(),
            destinations: vec![
                dest(&[("tier", "gold")], 0, 100),
                dest(&[("tier", "silver")], 1, 100),
            ],
            redirect: None,
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["b"]);
    }

    #[test]
    fn subset_open_fails_priority_over() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![
            inst_meta("a", true, &[("tier", "gold")]),
            inst_meta("b", true, &[("tier", "silver")]),
        ]);
        let mut view = SubsetStateView::default();
        view.open.insert("tier=gold#r1".to_string());
        info.instances.service().publish_subsets(view);
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: Vec::new(),
            destinations: vec![
                dest(&[("tier", "gold")], 0, 100),
                dest(&[("tier", "silver")], 1, 100),
            ],
            redirect: None,
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["b"]);
    }

    #[test]
    fn preserved_subset_is_deprioritized_not_dropped() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![inst_meta("a", true, &[("tier", "gold")])]);
        let mut view = SubsetStateView::default();
        view.preserved.insert("tier=gold#r1".to_string());
        info.instances.service().publish_subsets(view);
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: Vec::new(),
            destinations: vec![dest(&[("tier", "gold")], 0, 100)],
            redirect: None,
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        // Nothing healthier exists, so the preserved subset still serves.
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["a"]);
    }

    #[test]
    fn source_matcher_gates_rule() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![
            inst_meta("a", true, &[("env", "base")]),
            inst_meta("b", true, &[("env", "feature")]),
        ]);
        info.source = Some(ServiceInfo {
            service_key: Some(ServiceKey::new("Test", "caller")),
            metadata: HashMap::from([("env".to_string(), "feature".to_string())]),
        });
        let rules = vec![
            RouteRule {
                id: "r-feature".to_string(),
                sources: vec![RuleSource {
                    service: None,
                    metadata: HashMap::from([(
                        "env".to_string(),
                        MatchString::exact("feature"),
                    )]),
                }],
                destinations: vec![dest(&[("env", "feature")], 0, 100)],
                redirect: None,
            },
            RouteRule {
                id: "r-base".to_string(),
                sources: Vec::new(),
                destinations: vec![dest(&[("env", "base")], 0, 100)],
                redirect: None,
            },
        ];
        info.dest_route_rule = Some(route_rule_data(rules, true));
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["b"]);
    }

    #[test]
    fn regex_matcher_matches_values() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![
            inst_meta("a", true, &[("version", "v1.2")]),
            inst_meta("b", true, &[("version", "v2.0")]),
        ]);
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: Vec::new(),
            destinations: vec![RuleDestination {
                metadata: HashMap::from([(
                    "version".to_string(),
                    MatchString::regex("^v1\\..*"),
                )]),
                priority: 0,
                weight: 100,
            }],
            redirect: None,
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["a"]);
    }

    #[test]
    fn parameter_matcher_binds_caller_metadata() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![
            inst_meta("a", true, &[("shard", "s1")]),
            inst_meta("b", true, &[("shard", "s2")]),
        ]);
        info.source = Some(ServiceInfo {
            service_key: None,
            metadata: HashMap::from([("shard".to_string(), "s2".to_string())]),
        });
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: Vec::new(),
            destinations: vec![RuleDestination {
                metadata: HashMap::from([(
                    "shard".to_string(),
                    MatchString {
                        kind: MatchKind::Parameter,
                        value: "$shard".to_string(),
                    },
                )]),
                priority: 0,
                weight: 100,
            }],
            redirect: None,
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["b"]);
    }

    #[test]
    fn redirect_rule_ends_the_chain() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![inst("a", true)]);
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: Vec::new(),
            destinations: Vec::new(),
            redirect: Some(ServiceKey::new("Test", "elsewhere")),
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        match router.route(&mut info).unwrap() {
            RouteAction::Redirect(target) => assert_eq!(target, ServiceKey::new("Test", "elsewhere")),
            _ => panic!("redirect expected"),
        }
    }

    #[test]
    fn unmatched_rules_error() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![inst("a", true)]);
        let rule = RouteRule {
            id: "r1".to_string(),
            sources: vec![RuleSource {
                service: Some(ServiceKey::new("Other", "svc")),
                metadata: HashMap::new(),
            }],
            destinations: vec![dest(&[], 0, 100)],
            redirect: None,
        };
        info.dest_route_rule = Some(route_rule_data(vec![rule], true));
        let err = router.route(&mut info).unwrap_err();
        assert_eq!(err.code(), ReturnCode::RouteRuleNotMatch);
    }

    #[test]
    fn outbound_rules_used_without_inbounds() {
        let router = RuleRouter::new();
        let mut info = info_for(vec![
            inst_meta("a", true, &[("env", "base")]),
            inst_meta("b", true, &[("env", "feature")]),
        ]);
        let rule = RouteRule {
            id: "out-1".to_string(),
            sources: Vec::new(),
            destinations: vec![dest(&[("env", "feature")], 0, 100)],
            redirect: None,
        };
        info.source_route_rule = Some(route_rule_data(vec![rule], false));
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["b"]);
    }
}
