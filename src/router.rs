use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::config::{HeaderMatch, RouteRule};
use crate::protocol::Headers;
use crate::{ExtProcError, Result};

static ROLL_FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Index of the chosen backend inside the config's rule list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteSelection {
    pub rule: usize,
    pub backend: usize,
}

#[derive(Debug)]
pub struct Router {
    rules: Vec<CompiledRule>,
}

#[derive(Debug)]
struct CompiledRule {
    matchers: Vec<HeaderMatcher>,
    weights: Vec<u32>,
}

#[derive(Debug)]
enum HeaderMatcher {
    Exact { name: String, value: String },
    Regex { name: String, regex: Regex },
}

impl HeaderMatcher {
    fn compile(matcher: &HeaderMatch) -> Result<Self> {
        let name = matcher.name.trim().to_ascii_lowercase();
        match (&matcher.value, &matcher.regex) {
            (Some(value), None) => Ok(Self::Exact {
                name,
                value: value.clone(),
            }),
            (None, Some(pattern)) => {
                // Full-match semantics, like the proxy's own header matchers.
                let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|err| {
                    ExtProcError::Config(format!("invalid header regex {pattern:?}: {err}"))
                })?;
                Ok(Self::Regex { name, regex })
            }
            _ => Err(ExtProcError::Config(format!(
                "header match {:?} must set exactly one of value or regex",
                matcher.name
            ))),
        }
    }

    fn matches(&self, headers: &Headers) -> bool {
        match self {
            Self::Exact { name, value } => headers.get(name).is_some_and(|v| v == value),
            Self::Regex { name, regex } => headers.get(name).is_some_and(|v| regex.is_match(v)),
        }
    }
}

impl Router {
    pub fn new(rules: &[RouteRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let matchers = rule
                    .headers
                    .iter()
                    .map(HeaderMatcher::compile)
                    .collect::<Result<Vec<_>>>()?;
                let weights = rule.backends.iter().map(|backend| backend.weight).collect();
                Ok(CompiledRule { matchers, weights })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// First rule whose predicates all match, in declared order.
    pub fn matching_rule(&self, headers: &Headers) -> Option<usize> {
        self.rules.iter().position(|rule| {
            rule.matchers
                .iter()
                .all(|matcher| matcher.matches(headers))
        })
    }

    pub fn select(&self, headers: &Headers) -> Result<RouteSelection> {
        self.select_with_roll(headers, random_roll())
    }

    /// Same as [`Router::select`] with the random draw supplied by the caller.
    pub fn select_with_roll(&self, headers: &Headers, roll: u64) -> Result<RouteSelection> {
        let rule = self
            .matching_rule(headers)
            .ok_or(ExtProcError::NoRouteMatched)?;
        let backend =
            select_weighted(&self.rules[rule].weights, roll).ok_or(ExtProcError::NoRouteMatched)?;
        Ok(RouteSelection { rule, backend })
    }
}

/// Picks an index with probability proportional to its weight. Zero weights
/// are never picked; `None` when every weight is zero.
fn select_weighted(weights: &[u32], roll: u64) -> Option<usize> {
    let total_weight: u64 = weights.iter().map(|weight| u64::from(*weight)).sum();
    if total_weight == 0 {
        return None;
    }

    let mut pick = roll % total_weight;
    for (idx, weight) in weights.iter().enumerate() {
        let weight = u64::from(*weight);
        if pick < weight {
            return Some(idx);
        }
        pick -= weight;
    }
    None
}

fn random_roll() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_ok() {
        return u64::from_le_bytes(bytes);
    }
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let seq = ROLL_FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
    hash64_fnv1a(format!("{ts_nanos}:{seq}").as_bytes())
}

fn hash64_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiSchemaName, RuleBackend, VersionedApiSchema};

    fn backend(name: &str, weight: u32) -> RuleBackend {
        RuleBackend::new(name, VersionedApiSchema::new(ApiSchemaName::OpenAi)).with_weight(weight)
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn first_matching_rule_wins_over_later_superset() {
        let rules = vec![
            RouteRule {
                headers: vec![
                    HeaderMatch::exact("x-model", "gpt-4o"),
                    HeaderMatch::exact("x-tenant", "a"),
                ],
                backends: vec![backend("first", 1)],
            },
            RouteRule {
                headers: vec![HeaderMatch::exact("x-model", "gpt-4o")],
                backends: vec![backend("second", 1)],
            },
        ];
        let router = Router::new(&rules).expect("router");

        let both = headers(&[("x-model", "gpt-4o"), ("x-tenant", "a")]);
        assert_eq!(router.select(&both).expect("route").rule, 0);

        let only_model = headers(&[("x-model", "gpt-4o"), ("x-tenant", "b")]);
        assert_eq!(router.select(&only_model).expect("route").rule, 1);
    }

    #[test]
    fn regex_matches_whole_value_and_names_are_case_insensitive() {
        let rules = vec![RouteRule {
            headers: vec![HeaderMatch::regex("X-Model", "anthropic\\..*")],
            backends: vec![backend("bedrock", 1)],
        }];
        let router = Router::new(&rules).expect("router");
        assert!(
            router
                .select(&headers(&[("x-model", "anthropic.claude-3")]))
                .is_ok()
        );
        assert!(matches!(
            router.select(&headers(&[("x-model", "us.anthropic.claude-3")])),
            Err(ExtProcError::NoRouteMatched)
        ));
    }

    #[test]
    fn no_match_is_an_error_not_a_default() {
        let rules = vec![RouteRule {
            headers: vec![HeaderMatch::exact("x-model", "gpt-4o")],
            backends: vec![backend("openai", 1)],
        }];
        let router = Router::new(&rules).expect("router");
        assert!(matches!(
            router.select(&headers(&[("x-model", "llama")])),
            Err(ExtProcError::NoRouteMatched)
        ));
        assert!(matches!(
            router.select(&Headers::new()),
            Err(ExtProcError::NoRouteMatched)
        ));
    }

    #[test]
    fn weighted_selection_follows_rolls_and_skips_zero_weights() {
        let weights = [1, 0, 3];
        assert_eq!(select_weighted(&weights, 0), Some(0));
        assert_eq!(select_weighted(&weights, 1), Some(2));
        assert_eq!(select_weighted(&weights, 3), Some(2));
        assert_eq!(select_weighted(&weights, 4), Some(0));
        assert_eq!(select_weighted(&[0, 0], 7), None);
        assert_eq!(select_weighted(&[], 7), None);
    }

    #[test]
    fn weighted_random_draw_prefers_heavier_backend() {
        let rules = vec![RouteRule {
            headers: Vec::new(),
            backends: vec![backend("foo", 1), backend("bar", 3)],
        }];
        let router = Router::new(&rules).expect("router");
        let mut bar = 0;
        for _ in 0..1000 {
            if router.select(&Headers::new()).expect("route").backend == 1 {
                bar += 1;
            }
        }
        assert!(bar > 650, "bar selected {bar} times");
    }

    #[test]
    fn all_zero_weights_reject_the_request() {
        let rules = vec![RouteRule {
            headers: Vec::new(),
            backends: vec![backend("foo", 0)],
        }];
        let router = Router::new(&rules).expect("router");
        assert!(matches!(
            router.select(&Headers::new()),
            Err(ExtProcError::NoRouteMatched)
        ));
    }
}
