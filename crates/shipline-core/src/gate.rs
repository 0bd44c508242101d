//! Gate rules engine.
//!
//! A [`Gate`] is a named predicate over the trigger context and injected
//! external state. [`evaluate_gate`] is pure: the engine resolves every
//! [`PullRequestQuery`] the gates declare before evaluation and hands the
//! answers over in a [`GateContext`]. A deny is a normal control outcome of
//! the run, not an error.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, EventKind, GateOutcome, TriggerContext};
use crate::lookup::{PullRequest, PullRequestLookup, PullRequestQuery};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Allow or deny, with a human-readable reason on deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Deny { reason: String },
}

impl GateDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        GateDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            GateDecision::Allow => None,
            GateDecision::Deny { reason } => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// A single gate rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRule {
    /// Deny while an open pull request targets `base` (the trigger's target
    /// branch when unset). With `head_prefix`, only pull requests whose head
    /// branch starts with the prefix count.
    NoOpenPullRequest {
        #[serde(default)]
        base: Option<String>,
        #[serde(default)]
        head_prefix: Option<String>,
        /// Ignore the pull request that fired the trigger.
        #[serde(default = "default_true")]
        ignore_source: bool,
    },
    /// Target branch must match the regex.
    BranchMatches { pattern: String },
    /// Trigger event must be one of `any_of`.
    EventIn { any_of: Vec<EventKind> },
    /// Trigger action must be one of `actions`.
    ActionIn { actions: Vec<String> },
}

/// A named gate, optionally scoped to a subset of events.
///
/// Deserialization rejects keys the rule does not define.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGate")]
pub struct Gate {
    pub name: String,
    /// Events this gate applies to; empty means all.
    #[serde(default)]
    pub events: Vec<EventKind>,
    #[serde(flatten)]
    pub rule: GateRule,
}

/// Gate as written, before its rule keys are checked.
#[derive(Deserialize)]
struct RawGate {
    name: String,
    #[serde(default)]
    events: Vec<EventKind>,
    #[serde(flatten)]
    rule: serde_json::Map<String, serde_json::Value>,
}

impl GateRule {
    /// Keys a rule of `kind` accepts besides `type`.
    fn known_keys(kind: &str) -> Option<&'static [&'static str]> {
        match kind {
            "no_open_pull_request" => Some(&["base", "head_prefix", "ignore_source"]),
            "branch_matches" => Some(&["pattern"]),
            "event_in" => Some(&["any_of"]),
            "action_in" => Some(&["actions"]),
            _ => None,
        }
    }
}

impl TryFrom<RawGate> for Gate {
    type Error = String;

    fn try_from(raw: RawGate) -> Result<Self, Self::Error> {
        let name = raw.name;
        let kind = raw
            .rule
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("gate {name}: missing rule `type`"))?;
        let known = GateRule::known_keys(kind)
            .ok_or_else(|| format!("gate {name}: unknown rule type `{kind}`"))?;
        if let Some(key) = raw
            .rule
            .keys()
            .find(|k| k.as_str() != "type" && !known.contains(&k.as_str()))
        {
            return Err(format!(
                "gate {name}: unknown key `{key}` for {kind} (expected {})",
                known.join(", ")
            ));
        }

        let rule = serde_json::from_value(serde_json::Value::Object(raw.rule))
            .map_err(|e| format!("gate {name}: {e}"))?;
        Ok(Gate {
            name,
            events: raw.events,
            rule,
        })
    }
}

impl Gate {
    pub fn new(name: impl Into<String>, rule: GateRule) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            rule,
        }
    }

    /// Restrict the gate to the given events.
    pub fn on(mut self, events: impl IntoIterator<Item = EventKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn applies_to(&self, trigger: &TriggerContext) -> bool {
        self.events.is_empty() || self.events.contains(&trigger.event)
    }

    /// External lookup this gate needs for `trigger`, if any.
    pub fn lookup_query(&self, trigger: &TriggerContext) -> Option<PullRequestQuery> {
        if !self.applies_to(trigger) {
            return None;
        }
        match &self.rule {
            GateRule::NoOpenPullRequest { base, .. } => Some(PullRequestQuery::open_against(
                base.clone().unwrap_or_else(|| trigger.target_branch.clone()),
            )),
            _ => None,
        }
    }

    /// Reject gates that could never evaluate meaningfully.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidGate {
            gate: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("gate name must not be empty"));
        }
        match &self.rule {
            GateRule::BranchMatches { pattern } => {
                Regex::new(pattern).map_err(|e| invalid(&format!("bad pattern: {e}")))?;
            }
            GateRule::EventIn { any_of } if any_of.is_empty() => {
                return Err(invalid("event_in needs at least one event"));
            }
            GateRule::ActionIn { actions } if actions.is_empty() => {
                return Err(invalid("action_in needs at least one action"));
            }
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Trigger plus the external lookup answers injected by the engine.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub trigger: TriggerContext,
    pull_requests: BTreeMap<PullRequestQuery, Vec<PullRequest>>,
    lookup_errors: BTreeMap<PullRequestQuery, String>,
}

impl GateContext {
    pub fn new(trigger: TriggerContext) -> Self {
        Self {
            trigger,
            pull_requests: BTreeMap::new(),
            lookup_errors: BTreeMap::new(),
        }
    }

    pub fn with_pull_requests(mut self, query: PullRequestQuery, prs: Vec<PullRequest>) -> Self {
        self.pull_requests.insert(query, prs);
        self
    }

    pub fn with_lookup_error(mut self, query: PullRequestQuery, error: impl Into<String>) -> Self {
        self.lookup_errors.insert(query, error.into());
        self
    }

    pub fn pull_requests(&self, query: &PullRequestQuery) -> Option<&[PullRequest]> {
        self.pull_requests.get(query).map(Vec::as_slice)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate one gate. Performs no I/O.
///
/// A gate that does not apply to the trigger event allows. A lookup that
/// failed or was never injected denies.
pub fn evaluate_gate(gate: &Gate, ctx: &GateContext) -> GateDecision {
    let trigger = &ctx.trigger;
    if !gate.applies_to(trigger) {
        return GateDecision::Allow;
    }

    match &gate.rule {
        GateRule::NoOpenPullRequest {
            head_prefix,
            ignore_source,
            ..
        } => {
            let Some(query) = gate.lookup_query(trigger) else {
                return GateDecision::Allow;
            };
            if let Some(err) = ctx.lookup_errors.get(&query) {
                return GateDecision::deny(format!(
                    "pull request lookup for {} failed: {err}",
                    query.base
                ));
            }
            let Some(prs) = ctx.pull_requests(&query) else {
                return GateDecision::deny(format!(
                    "no pull request lookup result for {}",
                    query.base
                ));
            };

            let blocking = prs.iter().find(|pr| {
                let prefix_ok = head_prefix
                    .as_deref()
                    .map_or(true, |p| pr.head.starts_with(p));
                let is_source = *ignore_source
                    && (trigger.pull_request == Some(pr.number) || pr.head == trigger.source_ref);
                prefix_ok && !is_source
            });

            match blocking {
                Some(pr) => GateDecision::deny(format!(
                    "open pull request #{} ({}) targets {}",
                    pr.number, pr.head, query.base
                )),
                None => GateDecision::Allow,
            }
        }
        GateRule::BranchMatches { pattern } => match Regex::new(pattern) {
            Ok(re) if re.is_match(&trigger.target_branch) => GateDecision::Allow,
            Ok(_) => GateDecision::deny(format!(
                "branch {} does not match {pattern}",
                trigger.target_branch
            )),
            Err(e) => GateDecision::deny(format!("invalid branch pattern {pattern}: {e}")),
        },
        GateRule::EventIn { any_of } => {
            if any_of.contains(&trigger.event) {
                GateDecision::Allow
            } else {
                GateDecision::deny(format!("event {} is not permitted", trigger.event))
            }
        }
        GateRule::ActionIn { actions } => match &trigger.action {
            Some(action) if actions.iter().any(|a| a == action) => GateDecision::Allow,
            Some(action) => GateDecision::deny(format!("action {action} is not permitted")),
            None => GateDecision::deny(format!(
                "trigger has no action (expected one of {})",
                actions.join(", ")
            )),
        },
    }
}

/// Ordered gates with a fail-fast flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSet {
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub fail_fast: bool,
}

impl GateSet {
    pub fn new(gates: Vec<Gate>) -> Self {
        Self {
            gates,
            fail_fast: false,
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Distinct lookups needed for `trigger`.
    pub fn queries(&self, trigger: &TriggerContext) -> BTreeSet<PullRequestQuery> {
        self.gates
            .iter()
            .filter_map(|g| g.lookup_query(trigger))
            .collect()
    }

    /// Resolve every declared lookup once and build the gate context.
    ///
    /// Lookup failures are recorded in the context so the gates that needed
    /// them deny. Without a lookup source every query counts as failed.
    pub async fn prepare_context(
        &self,
        trigger: &TriggerContext,
        lookup: Option<&dyn PullRequestLookup>,
    ) -> GateContext {
        let mut ctx = GateContext::new(trigger.clone());
        for query in self.queries(trigger) {
            ctx = match lookup {
                Some(source) => match source.pull_requests(&query).await {
                    Ok(prs) => ctx.with_pull_requests(query, prs),
                    Err(e) => {
                        tracing::warn!(
                            base = %query.base,
                            error = %e,
                            "pull request lookup failed"
                        );
                        ctx.with_lookup_error(query, e.to_string())
                    }
                },
                None => ctx.with_lookup_error(query, "no pull request lookup configured"),
            };
        }
        ctx
    }

    /// Evaluate gates in order. With `fail_fast`, stops at the first deny.
    pub fn evaluate(&self, ctx: &GateContext) -> GateReport {
        let mut outcomes = Vec::new();
        for gate in &self.gates {
            let decision = evaluate_gate(gate, ctx);
            let denied = !decision.is_allow();
            outcomes.push(GateOutcome {
                gate: gate.name.clone(),
                decision,
            });
            if denied && self.fail_fast {
                break;
            }
        }
        GateReport { outcomes }
    }
}

/// Per-gate decisions of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub outcomes: Vec<GateOutcome>,
}

impl GateReport {
    pub fn allowed(&self) -> bool {
        self.outcomes.iter().all(|o| o.decision.is_allow())
    }

    /// Combined reason of every deny, `None` when all gates allowed.
    pub fn denial_reason(&self) -> Option<String> {
        let reasons: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|o| o.decision.reason().map(|r| format!("{}: {r}", o.gate)))
            .collect();
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }
}
