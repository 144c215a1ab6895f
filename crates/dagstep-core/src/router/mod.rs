//! Router branching engine.
//!
//! A router step turns one runtime value into the set of downstream step
//! names that become eligible to run. Route tables are compiled once when
//! the step is built; evaluation afterwards is total and never fails.

pub mod expr;
pub mod pattern;

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DagstepError, Result};
pub use pattern::Pattern;

const MAX_VALUE_LEN: usize = 4096;
const MAX_ROUTES: usize = 1000;

/// How matching routes are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouterMode {
    /// First matching route only.
    #[default]
    Exclusive,
    /// Union of every matching route.
    MultiSelect,
}

/// Declarative routing table of a router step.
///
/// `routes` keeps declaration order; it decides which route wins under
/// [`RouterMode::Exclusive`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub mode: RouterMode,
    #[serde(default)]
    pub routes: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub default: Vec<String>,
}

impl RouterConfig {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn mode(mut self, mode: RouterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn route<I, S>(mut self, pattern: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .insert(pattern.into(), targets.into_iter().map(Into::into).collect());
        self
    }

    pub fn default_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Check the table without keeping the compiled form.
    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }

    /// Validate the table and compile every pattern.
    pub fn compile(&self) -> Result<CompiledRouter> {
        if self.value.is_empty() {
            return Err(DagstepError::config("router.value is required"));
        }
        if self.value.len() > MAX_VALUE_LEN {
            return Err(DagstepError::config(format!(
                "router.value exceeds 4KB limit (got {} bytes)",
                self.value.len()
            )));
        }
        if self.routes.is_empty() && self.default.is_empty() {
            return Err(DagstepError::config(
                "router must have 'routes' or 'default' specified",
            ));
        }
        if self.routes.len() > MAX_ROUTES {
            return Err(DagstepError::config(format!(
                "router routes limit exceeded: {} routes (max {MAX_ROUTES})",
                self.routes.len()
            )));
        }
        for (i, target) in self.default.iter().enumerate() {
            if target.trim().is_empty() {
                return Err(DagstepError::config(format!("router.default[{i}] is empty")));
            }
        }

        let mut routes = Vec::with_capacity(self.routes.len());
        for (source, targets) in &self.routes {
            let pattern = Pattern::compile(source).map_err(|e| {
                DagstepError::config(format!("invalid route pattern '{source}': {e}"))
            })?;
            if targets.is_empty() {
                return Err(DagstepError::config(format!(
                    "router route '{source}' has no steps"
                )));
            }
            for (i, target) in targets.iter().enumerate() {
                if target.trim().is_empty() {
                    return Err(DagstepError::config(format!(
                        "router route '{source}' step[{i}] is empty"
                    )));
                }
            }
            routes.push(CompiledRoute {
                source: source.clone(),
                pattern,
                targets: targets.clone(),
            });
        }

        Ok(CompiledRouter {
            value: self.value.clone(),
            mode: self.mode,
            routes,
            default: self.default.clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    source: String,
    pattern: Pattern,
    targets: Vec<String>,
}

/// A validated route table, ready to evaluate.
#[derive(Debug, Clone)]
pub struct CompiledRouter {
    value: String,
    mode: RouterMode,
    routes: Vec<CompiledRoute>,
    default: Vec<String>,
}

/// Patterns that matched and the steps they activate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub matched_patterns: Vec<String>,
    pub activated_steps: Vec<String>,
}

impl CompiledRouter {
    /// The unresolved `value` template.
    pub fn value_template(&self) -> &str {
        &self.value
    }

    pub fn mode(&self) -> RouterMode {
        self.mode
    }

    /// Decide which steps `value` activates. Deterministic and total.
    pub fn evaluate(&self, value: &str, exit_code: i32) -> Decision {
        let mut decision = Decision::default();
        let mut seen = HashSet::new();

        for route in &self.routes {
            let matched = match route.pattern.matches(value, exit_code) {
                Ok(m) => m,
                Err(e) => {
                    warn!(pattern = %route.source, error = %e, "Route expression failed; treating as no match");
                    false
                }
            };
            if !matched {
                continue;
            }
            decision.matched_patterns.push(route.source.clone());
            for target in &route.targets {
                if seen.insert(target.as_str()) {
                    decision.activated_steps.push(target.clone());
                }
            }
            if self.mode == RouterMode::Exclusive {
                break;
            }
        }

        if decision.matched_patterns.is_empty() {
            for target in &self.default {
                if seen.insert(target.as_str()) {
                    decision.activated_steps.push(target.clone());
                }
            }
        }

        decision
    }
}

/// Upstream values a router step branches on, supplied by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterInput {
    /// Output variables of upstream steps, referenced as `${NAME}`.
    pub variables: BTreeMap<String, String>,
    /// Exit code of the upstream step, referenced as `@exitCode`.
    pub exit_code: i32,
}

impl RouterInput {
    pub fn new(exit_code: i32) -> Self {
        Self {
            variables: BTreeMap::new(),
            exit_code,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Substitute `${NAME}` and `@exitCode` in a value template.
    /// Unknown variables are left as written.
    pub fn resolve(&self, template: &str) -> String {
        let exit_code = self.exit_code.to_string();
        // Only template text is scanned for `@exitCode`, never substituted values.
        let literal = |out: &mut String, text: &str| out.push_str(&text.replace("@exitCode", &exit_code));

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            literal(&mut out, &rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.variables.get(name) {
                        Some(v) => out.push_str(v),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    literal(&mut out, &rest[start..]);
                    rest = "";
                }
            }
        }
        literal(&mut out, rest);
        out
    }
}

/// Outcome of one router run. Handed out by value, never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterResult {
    pub evaluated_value: String,
    pub evaluated_at: DateTime<Utc>,
    pub matched_patterns: Vec<String>,
    pub activated_steps: Vec<String>,
}

impl RouterResult {
    pub fn new(evaluated_value: impl Into<String>, decision: Decision) -> Self {
        Self {
            evaluated_value: evaluated_value.into(),
            evaluated_at: Utc::now(),
            matched_patterns: decision.matched_patterns,
            activated_steps: decision.activated_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit_code_router() -> RouterConfig {
        RouterConfig::new("@exitCode")
            .route("0", ["success"])
            .route("1", ["error"])
    }

    #[test]
    fn test_exclusive_picks_matching_route() {
        let router = exit_code_router().compile().unwrap();
        let d = router.evaluate("0", 0);
        assert_eq!(d.matched_patterns, vec!["0"]);
        assert_eq!(d.activated_steps, vec!["success"]);
        let d = router.evaluate("1", 1);
        assert_eq!(d.activated_steps, vec!["error"]);
    }

    #[test]
    fn test_exclusive_first_declared_wins() {
        let router = RouterConfig::new("v")
            .route("/^err/", ["regex_handler"])
            .route("error", ["literal_handler"])
            .compile()
            .unwrap();
        let d = router.evaluate("error", 0);
        assert_eq!(d.matched_patterns, vec!["/^err/"]);
        assert_eq!(d.activated_steps, vec!["regex_handler"]);

        // Same inputs, same answer.
        assert_eq!(router.evaluate("error", 0), d);
    }

    #[test]
    fn test_multi_select_union_dedup() {
        let router = RouterConfig::new("v")
            .mode(RouterMode::MultiSelect)
            .route("/a|b/", ["x"])
            .route("[ab, c]", ["x", "y"])
            .compile()
            .unwrap();
        let d = router.evaluate("ab", 0);
        assert_eq!(d.matched_patterns, vec!["/a|b/", "[ab, c]"]);
        assert_eq!(d.activated_steps, vec!["x", "y"]);
    }

    #[test]
    fn test_default_when_nothing_matches() {
        let router = RouterConfig::new("v")
            .route("1", ["error_handler"])
            .default_targets(["default_handler"])
            .compile()
            .unwrap();
        let d = router.evaluate("0", 0);
        assert!(d.matched_patterns.is_empty());
        assert_eq!(d.activated_steps, vec!["default_handler"]);
    }

    #[test]
    fn test_no_match_no_default_is_empty_not_absent() {
        let router = RouterConfig::new("v")
            .route("999", ["never"])
            .compile()
            .unwrap();
        let result = RouterResult::new("0", router.evaluate("0", 0));
        assert_eq!(result.matched_patterns, Vec::<String>::new());
        assert_eq!(result.activated_steps, Vec::<String>::new());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["matchedPatterns"], serde_json::json!([]));
        assert_eq!(json["activatedSteps"], serde_json::json!([]));
        assert_eq!(json["evaluatedValue"], "0");
    }

    #[test]
    fn test_expression_routes_see_exit_code() {
        let router = RouterConfig::new("v")
            .mode(RouterMode::MultiSelect)
            .route("@exitCode == 0 && @value == 'ok'", ["happy"])
            .route("@exitCode != 0", ["sad"])
            .compile()
            .unwrap();
        assert_eq!(router.evaluate("ok", 0).activated_steps, vec!["happy"]);
        assert_eq!(router.evaluate("ok", 3).activated_steps, vec!["sad"]);
    }

    #[test]
    fn test_failing_expression_is_no_match() {
        // Validates structurally but is missing a right operand.
        let router = RouterConfig::new("v")
            .route("@value ==", ["broken"])
            .default_targets(["fallback"])
            .compile()
            .unwrap();
        let d = router.evaluate("x", 0);
        assert!(d.matched_patterns.is_empty());
        assert_eq!(d.activated_steps, vec!["fallback"]);
    }

    #[test]
    fn test_validation_errors() {
        let err = RouterConfig::new("").route("0", ["a"]).validate().unwrap_err();
        assert!(err.to_string().contains("router.value is required"));

        let err = RouterConfig::new("v").validate().unwrap_err();
        assert!(err.to_string().contains("'routes' or 'default'"));

        let err = RouterConfig::new("v")
            .route("/^[unclosed/", ["a"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("invalid route pattern"));

        let err = RouterConfig::new("v")
            .route("0", Vec::<String>::new())
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("has no steps"));

        let err = RouterConfig::new("v").route("0", [" "]).validate().unwrap_err();
        assert!(err.to_string().contains("step[0] is empty"));

        let err = RouterConfig::new("v".repeat(MAX_VALUE_LEN + 1))
            .default_targets(["a"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("4KB"));

        assert!(RouterConfig::new("v").default_targets(["a"]).validate().is_ok());
    }

    #[test]
    fn test_route_limit() {
        let mut cfg = RouterConfig::new("v");
        for i in 0..=MAX_ROUTES {
            cfg.routes.insert(i.to_string(), vec!["s".into()]);
        }
        assert!(cfg.validate().unwrap_err().to_string().contains("limit exceeded"));
    }

    #[test]
    fn test_mode_wire_format() {
        let cfg: RouterConfig = serde_json::from_str(
            r#"{"value": "v", "mode": "multi-select", "routes": {"b": ["1"], "a": ["2"]}}"#,
        )
        .unwrap();
        assert_eq!(cfg.mode, RouterMode::MultiSelect);
        // Declaration order survives deserialization.
        assert_eq!(cfg.routes.keys().collect::<Vec<_>>(), vec!["b", "a"]);

        let cfg: RouterConfig = serde_json::from_str(r#"{"value": "v", "default": ["d"]}"#).unwrap();
        assert_eq!(cfg.mode, RouterMode::Exclusive);

        assert!(serde_json::from_str::<RouterConfig>(r#"{"value": "v", "mode": "random"}"#).is_err());
    }

    #[test]
    fn test_input_resolution() {
        let input = RouterInput::new(2).with_variable("STATUS", "ready");
        assert_eq!(input.resolve("@exitCode"), "2");
        assert_eq!(input.resolve("${STATUS}"), "ready");
        assert_eq!(input.resolve("${STATUS}-${MISSING}"), "ready-${MISSING}");
        assert_eq!(input.resolve("plain"), "plain");
        assert_eq!(input.resolve("open ${STATUS"), "open ${STATUS");
        assert_eq!(RouterInput::default().resolve("@exitCode"), "0");
    }

    #[test]
    fn test_variable_values_are_not_rescanned() {
        let input = RouterInput::new(3).with_variable("MSG", "saw @exitCode");
        assert_eq!(input.resolve("${MSG}"), "saw @exitCode");
        assert_eq!(input.resolve("@exitCode:${MSG}"), "3:saw @exitCode");
        assert_eq!(input.resolve("${NOPE}@exitCode"), "${NOPE}3");
    }
}
