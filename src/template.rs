//! Placeholder rendering for request fields and condition expressions.
//!
//! Two disjoint syntaxes are recognised in a single left-to-right pass:
//!
//! - `{{identifier}}` resolves against the function library first, then
//!   against environment/global variables.
//! - `${identifier}` resolves against chain variables only. The
//!   SoapUI-style `${#TestCase#identifier}` is accepted as an alias.
//!
//! Unmatched placeholders are left verbatim and reported as
//! [`ResolutionGap`]s. Inserted values are never re-scanned.

use crate::environment::VariableSource;
use crate::error::{Namespace, ResolutionGap};
use chrono::{Duration, Months, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;
use uuid::Uuid;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}|\$\{\s*([^{}]*?)\s*\}")
        .expect("failed to compile placeholder regex")
});

static LOREM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^lorem\(\s*(\d+)\s*\)$").expect("failed to compile lorem regex")
});

static RANDOM_INT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^randomInt\(\s*(-?\d+)\s*,\s*(-?\d+)\s*\)$")
        .expect("failed to compile randomInt regex")
});

static DATE_MATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^now([+-])(\d+)([dmy])$")
        .expect("failed to compile date math regex")
});

const LOREM_WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing",
    "elit", "sed", "do", "eiusmod", "tempor", "incididunt", "ut", "labore",
    "et", "dolore", "magna", "aliqua",
];

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "David", "Erin", "Frank", "Grace", "Henry",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Jones", "Brown", "Taylor", "Wilson", "Evans", "Walker", "Hall",
];

const COUNTRIES: &[&str] = &[
    "USA", "Canada", "UK", "Australia", "Germany", "France", "Japan", "Brazil",
];

const STATES: &[&str] = &[
    "California", "Texas", "Florida", "New York", "Ohio", "Illinois",
    "Washington",
];

/// Larger `lorem(n)` requests stay unresolved.
const MAX_LOREM_WORDS: usize = 10_000;

/// Values visible to one resolution.
#[derive(Clone, Copy)]
pub struct TemplateScope<'a> {
    pub environment: &'a dyn VariableSource,
    pub chain: &'a HashMap<String, String>,
}

impl<'a> TemplateScope<'a> {
    pub fn new(
        environment: &'a dyn VariableSource,
        chain: &'a HashMap<String, String>,
    ) -> Self {
        Self { environment, chain }
    }
}

/// Rendered text plus the placeholders that stayed unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub gaps: Vec<ResolutionGap>,
}

impl Rendered {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Render `text`, returning unresolved placeholders alongside.
pub fn render(text: &str, scope: &TemplateScope<'_>) -> Rendered {
    let mut gaps = Vec::new();
    let rendered = PLACEHOLDER_RE.replace_all(text, |caps: &Captures| {
        let resolved = if let Some(ident) = caps.get(1) {
            resolve_environment(ident.as_str(), scope.environment)
        } else {
            caps.get(2).and_then(|ident| resolve_chain(ident.as_str(), scope.chain))
        };

        match resolved {
            Some(value) => value,
            None => {
                gaps.push(ResolutionGap {
                    placeholder: caps[0].to_string(),
                    namespace: if caps.get(1).is_some() {
                        Namespace::Environment
                    } else {
                        Namespace::Chain
                    },
                });
                caps[0].to_string()
            }
        }
    });

    Rendered {
        text: rendered.into_owned(),
        gaps,
    }
}

/// Render `text`, discarding gap diagnostics.
pub fn resolve(text: &str, scope: &TemplateScope<'_>) -> String {
    render(text, scope).text
}

fn resolve_environment(
    ident: &str,
    environment: &dyn VariableSource,
) -> Option<String> {
    if ident.is_empty() {
        return None;
    }
    call_function(ident, environment).or_else(|| environment.lookup(ident))
}

fn resolve_chain(ident: &str, chain: &HashMap<String, String>) -> Option<String> {
    let name = ident.strip_prefix("#TestCase#").unwrap_or(ident);
    chain.get(name).cloned()
}

/// Evaluate a function-library identifier. `None` when the identifier
/// is not a function or its arguments are malformed.
fn call_function(ident: &str, environment: &dyn VariableSource) -> Option<String> {
    let mut rng = rand::thread_rng();
    match ident {
        "uuid" | "newguid" => return Some(Uuid::new_v4().to_string()),
        "now" => return Some(Utc::now().to_rfc3339()),
        "epoch" => return Some(Utc::now().timestamp().to_string()),
        "name" => {
            let first = FIRST_NAMES.choose(&mut rng)?;
            let last = LAST_NAMES.choose(&mut rng)?;
            return Some(format!("{first} {last}"));
        }
        "country" => return COUNTRIES.choose(&mut rng).map(|s| s.to_string()),
        "state" => return STATES.choose(&mut rng).map(|s| s.to_string()),
        "env" | "url" => return environment.endpoint_url(),
        _ => {}
    }

    if let Some(caps) = LOREM_RE.captures(ident) {
        let count: usize = caps[1].parse().ok().filter(|&n| n <= MAX_LOREM_WORDS)?;
        let words: Vec<&str> = (0..count)
            .filter_map(|_| LOREM_WORDS.choose(&mut rng).copied())
            .collect();
        return Some(words.join(" "));
    }

    if let Some(caps) = RANDOM_INT_RE.captures(ident) {
        let min: i64 = caps[1].parse().ok()?;
        let max: i64 = caps[2].parse().ok()?;
        if min > max {
            return None;
        }
        return Some(rng.gen_range(min..=max).to_string());
    }

    if let Some(caps) = DATE_MATH_RE.captures(ident) {
        return date_math(&caps[1], &caps[2], &caps[3]);
    }

    None
}

fn date_math(sign: &str, amount: &str, unit: &str) -> Option<String> {
    let amount: u32 = amount.parse().ok()?;
    let now = Utc::now();
    let forward = sign == "+";
    let shifted = match unit {
        "d" => {
            let delta = Duration::try_days(i64::from(amount))?;
            if forward {
                now.checked_add_signed(delta)
            } else {
                now.checked_sub_signed(delta)
            }
        }
        "m" | "y" => {
            let months = if unit == "y" {
                amount.checked_mul(12)?
            } else {
                amount
            };
            if forward {
                now.checked_add_months(Months::new(months))
            } else {
                now.checked_sub_months(Months::new(months))
            }
        }
        _ => None,
    }?;
    Some(shifted.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Datelike};

    fn chain(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_text_is_unchanged() {
        let env = chain(&[("a", "1")]);
        let vars = chain(&[("b", "2")]);
        let scope = TemplateScope::new(&env, &vars);
        let text = "<soap:Envelope>{ not a placeholder } $ {x}</soap:Envelope>";
        let rendered = render(text, &scope);
        assert_eq!(rendered.text, text);
        assert!(rendered.is_complete());
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let env = chain(&[("host", "env-host")]);
        let vars = chain(&[("host", "chain-host")]);
        let scope = TemplateScope::new(&env, &vars);
        assert_eq!(
            resolve("{{host}} ${host}", &scope),
            "env-host chain-host"
        );
    }

    #[test]
    fn test_unresolved_placeholders_stay_verbatim() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        let rendered = render("a={{missing}} b=${token}", &scope);
        assert_eq!(rendered.text, "a={{missing}} b=${token}");
        assert_eq!(rendered.gaps.len(), 2);
        assert_eq!(rendered.gaps[0].namespace, Namespace::Environment);
        assert_eq!(rendered.gaps[1].placeholder, "${token}");
        assert_eq!(rendered.gaps[1].namespace, Namespace::Chain);
    }

    #[test]
    fn test_functions_take_priority_over_environment() {
        let env = chain(&[("epoch", "shadowed")]);
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        let value = resolve("{{epoch}}", &scope);
        assert!(value.parse::<i64>().is_ok(), "got {value}");
    }

    #[test]
    fn test_uuid_is_fresh_per_placeholder() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        let out = resolve("{{uuid}} {{newguid}}", &scope);
        let ids: Vec<Uuid> = out
            .split(' ')
            .map(|s| Uuid::parse_str(s).unwrap())
            .collect();
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().all(|id| id.get_version_num() == 4));
    }

    #[test]
    fn test_no_recursive_expansion() {
        let env = chain(&[("outer", "{{inner}}"), ("inner", "deep")]);
        let vars = chain(&[("x", "${y}"), ("y", "z")]);
        let scope = TemplateScope::new(&env, &vars);
        assert_eq!(resolve("{{outer}} ${x}", &scope), "{{inner}} ${y}");
    }

    #[test]
    fn test_soapui_chain_alias() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = chain(&[("sessionId", "S1")]);
        let scope = TemplateScope::new(&env, &vars);
        assert_eq!(resolve("${#TestCase#sessionId}", &scope), "S1");
    }

    #[test]
    fn test_env_and_url_aliases() {
        let env = chain(&[("endpoint_url", "http://svc:8080")]);
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        assert_eq!(resolve("{{env}}|{{url}}", &scope), "http://svc:8080|http://svc:8080");

        let empty = HashMap::new();
        let scope = TemplateScope::new(&empty, &vars);
        assert_eq!(resolve("{{url}}", &scope), "{{url}}");
    }

    #[test]
    fn test_random_int_bounds() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        for _ in 0..50 {
            let n: i64 = resolve("{{randomInt(-2,3)}}", &scope).parse().unwrap();
            assert!((-2..=3).contains(&n));
        }
        assert_eq!(resolve("{{randomInt(5,1)}}", &scope), "{{randomInt(5,1)}}");
        assert_eq!(resolve("{{randomInt(a,b)}}", &scope), "{{randomInt(a,b)}}");
    }

    #[test]
    fn test_lorem_word_count() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        let text = resolve("{{lorem(7)}}", &scope);
        assert_eq!(text.split(' ').count(), 7);
        assert!(text.split(' ').all(|w| LOREM_WORDS.contains(&w)));
    }

    #[test]
    fn test_oversized_lorem_stays_unresolved() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        assert_eq!(resolve("{{lorem(10000)}}", &scope).split(' ').count(), 10_000);

        let rendered = render("{{lorem(99999999999)}}", &scope);
        assert_eq!(rendered.text, "{{lorem(99999999999)}}");
        assert_eq!(rendered.gaps.len(), 1);
    }

    #[test]
    fn test_lexicon_functions() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        assert!(COUNTRIES.contains(&resolve("{{country}}", &scope).as_str()));
        assert!(STATES.contains(&resolve("{{state}}", &scope).as_str()));
        let name = resolve("{{name}}", &scope);
        let (first, last) = name.split_once(' ').unwrap();
        assert!(FIRST_NAMES.contains(&first));
        assert!(LAST_NAMES.contains(&last));
    }

    #[test]
    fn test_now_plus_one_day() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        let out = resolve("{{now}}|{{now+1d}}", &scope);
        let (now, later) = out.split_once('|').unwrap();
        let now = DateTime::parse_from_rfc3339(now).unwrap();
        let later = DateTime::parse_from_rfc3339(later).unwrap();
        let diff = later - now;
        assert!((diff - Duration::days(1)).num_milliseconds().abs() < 1000);
    }

    #[test]
    fn test_month_and_year_math() {
        let env: HashMap<String, String> = HashMap::new();
        let vars = HashMap::new();
        let scope = TemplateScope::new(&env, &vars);
        let now = Utc::now();
        let next_year =
            DateTime::parse_from_rfc3339(&resolve("{{now+1y}}", &scope)).unwrap();
        assert_eq!(next_year.year(), now.year() + 1);

        let back = DateTime::parse_from_rfc3339(&resolve("{{now-2m}}", &scope)).unwrap();
        let months_back = (now.year() * 12 + now.month0() as i32)
            - (back.year() * 12 + back.month0() as i32);
        assert_eq!(months_back, 2);

        assert_eq!(resolve("{{now+1w}}", &scope), "{{now+1w}}");
    }
}
