use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{Datelike, Local, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::node::{LogLevel, NodeContext, NodeError, NodeExecutor, NodeResult};
use crate::ports::{ClassificationRequest, Classifier};
use crate::process::{log_port_call, render};
use crate::util::{as_number, is_empty_value, value_to_string};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    #[default]
    Simple,
    Advanced,
    Ai,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[default]
    #[serde(alias = "and", alias = "&&")]
    And,
    #[serde(alias = "or", alias = "||")]
    Or,
}

impl LogicalOperator {
    fn combine(self, acc: bool, next: bool) -> bool {
        match self {
            LogicalOperator::And => acc && next,
            LogicalOperator::Or => acc || next,
        }
    }

    /// Uniform fold: all for AND, any for OR. Empty is false.
    fn fold(self, results: &[bool]) -> bool {
        if results.is_empty() {
            return false;
        }
        match self {
            LogicalOperator::And => results.iter().all(|r| *r),
            LogicalOperator::Or => results.iter().any(|r| *r),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "eq", alias = "==")]
    Equals,
    #[serde(alias = "neq", alias = "!=")]
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    #[serde(alias = "gt", alias = ">")]
    GreaterThan,
    #[serde(alias = "lt", alias = "<")]
    LessThan,
    IsEmpty,
    IsNotEmpty,
    #[serde(alias = "regex", alias = "matches")]
    RegexMatch,
    /// Anything else never matches.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRule {
    #[serde(default)]
    pub id: Option<String>,
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    /// How this rule joins the running result of the rules before it.
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
}

/// Configuration shared by `condition`, `smartCondition` and `advancedCondition` nodes.
///
/// ```yaml
/// - id: check_age
///   type: condition
///   config:
///     rules:
///       - field: age
///         operator: greater_than
///         value: 18
///       - field: country
///         operator: equals
///         value: ES
///         logicalOperator: OR
///     trueNodeId: adult
///     falseNodeId: minor
/// ```
///
/// Simple mode folds rules left to right: the first rule seeds the result and
/// every later rule joins it with its own `logicalOperator`. Advanced mode
/// evaluates `groups`, each folded uniformly, and joins the groups with
/// `groupsLogicalOperator`. AI mode asks the classifier and falls back to the
/// simple rules when it is unavailable. When `trueNodeId`/`falseNodeId` are
/// missing the engine follows the edge labelled `true` or `false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionNodeConfig {
    pub mode: Option<EvaluationMode>,
    pub rules: Vec<ConditionRule>,
    pub groups: Vec<RuleGroup>,
    pub groups_logical_operator: LogicalOperator,
    pub true_node_id: Option<String>,
    pub false_node_id: Option<String>,
    pub ai_prompt: Option<String>,
    pub confidence_threshold: Option<f64>,
}

const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleOutcome {
    pub field: String,
    pub operator: Operator,
    pub expected: Value,
    pub actual: Value,
    pub result: bool,
}

/// Resolve a rule field: variables first, then the conversation aliases.
pub fn resolve_field(ctx: &NodeContext, field: &str) -> Option<Value> {
    if let Some(v) = ctx.get_variable(field) {
        return Some(v.clone());
    }
    match field {
        "userMessage" | "message" => ctx.message().map(|m| Value::String(m.to_string())),
        "userInput" | "input" => ctx.input().cloned(),
        "userId" => Some(Value::String(ctx.user_id().to_string())),
        "phoneNumber" => Some(Value::String(ctx.address().to_string())),
        "threadId" => Some(Value::String(ctx.thread_id().to_string())),
        "currentTime" => Some(Value::String(Utc::now().to_rfc3339())),
        "currentHour" => Some(json!(Local::now().hour())),
        "currentDay" => Some(json!(Local::now().weekday().num_days_from_sunday())),
        _ => None,
    }
}

/// Apply a single operator. A missing field only satisfies the emptiness checks.
pub fn evaluate_operator(operator: Operator, actual: Option<&Value>, expected: &Value) -> bool {
    let text = |v: &Value| value_to_string(v);
    match operator {
        Operator::Equals => actual.map(|a| text(a) == text(expected)).unwrap_or(false),
        Operator::NotEquals => actual.map(|a| text(a) != text(expected)).unwrap_or(true),
        Operator::Contains => actual
            .map(|a| text(a).to_lowercase().contains(&text(expected).to_lowercase()))
            .unwrap_or(false),
        Operator::NotContains => actual
            .map(|a| !text(a).to_lowercase().contains(&text(expected).to_lowercase()))
            .unwrap_or(true),
        Operator::StartsWith => actual
            .map(|a| text(a).to_lowercase().starts_with(&text(expected).to_lowercase()))
            .unwrap_or(false),
        Operator::EndsWith => actual
            .map(|a| text(a).to_lowercase().ends_with(&text(expected).to_lowercase()))
            .unwrap_or(false),
        Operator::GreaterThan => match (actual.and_then(as_number), as_number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        Operator::LessThan => match (actual.and_then(as_number), as_number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        Operator::IsEmpty => is_empty_value(actual),
        Operator::IsNotEmpty => !is_empty_value(actual),
        Operator::RegexMatch => match (actual, Regex::new(&text(expected))) {
            (Some(a), Ok(re)) => re.is_match(&text(a)),
            (_, Err(e)) => {
                warn!("invalid regex in condition rule: {}", e);
                false
            }
            _ => false,
        },
        Operator::Unknown => false,
    }
}

fn evaluate_rule<F>(rule: &ConditionRule, resolve: &F) -> RuleOutcome
where
    F: Fn(&str) -> Option<Value>,
{
    let actual = resolve(&rule.field);
    let result = evaluate_operator(rule.operator, actual.as_ref(), &rule.value);
    RuleOutcome {
        field: rule.field.clone(),
        operator: rule.operator,
        expected: rule.value.clone(),
        actual: actual.unwrap_or(Value::Null),
        result,
    }
}

/// Left-to-right fold over the enabled rules. No rules means false.
pub fn evaluate_simple<F>(rules: &[ConditionRule], resolve: &F) -> (bool, Vec<RuleOutcome>)
where
    F: Fn(&str) -> Option<Value>,
{
    let mut acc: Option<bool> = None;
    let mut details = Vec::new();
    for rule in rules.iter().filter(|r| r.enabled) {
        let outcome = evaluate_rule(rule, resolve);
        acc = Some(match acc {
            None => outcome.result,
            Some(prev) => rule.logical_operator.combine(prev, outcome.result),
        });
        details.push(outcome);
    }
    (acc.unwrap_or(false), details)
}

/// Groups fold uniformly with their own operator; the group results fold with `groups_op`.
pub fn evaluate_advanced<F>(
    groups: &[RuleGroup],
    groups_op: LogicalOperator,
    resolve: &F,
) -> (bool, Vec<Value>)
where
    F: Fn(&str) -> Option<Value>,
{
    let mut group_results = Vec::new();
    let mut details = Vec::new();
    for group in groups.iter().filter(|g| g.enabled) {
        let outcomes: Vec<RuleOutcome> = group
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| evaluate_rule(r, resolve))
            .collect();
        if outcomes.is_empty() {
            continue;
        }
        let results: Vec<bool> = outcomes.iter().map(|o| o.result).collect();
        let result = group.logical_operator.fold(&results);
        group_results.push(result);
        details.push(json!({
            "group": group.id,
            "operator": group.logical_operator,
            "result": result,
            "rules": outcomes,
        }));
    }
    (groups_op.fold(&group_results), details)
}

pub struct ConditionExecutor {
    default_mode: EvaluationMode,
    classifier: Option<Arc<dyn Classifier>>,
}

impl ConditionExecutor {
    pub fn new(classifier: Option<Arc<dyn Classifier>>) -> Self {
        Self {
            default_mode: EvaluationMode::Simple,
            classifier,
        }
    }

    /// Mode used when the node does not name one (`smartCondition` → AI, `advancedCondition` → advanced).
    pub fn with_mode(mut self, mode: EvaluationMode) -> Self {
        self.default_mode = mode;
        self
    }

    async fn evaluate_ai(&self, ctx: &mut NodeContext, cfg: &ConditionNodeConfig) -> Value {
        let resolve = |field: &str| resolve_field(ctx, field);
        let fallback = |reason: String| {
            let (result, details) = evaluate_simple(&cfg.rules, &resolve);
            json!({ "result": result, "method": "simple_fallback", "details": details, "fallbackReason": reason })
        };

        let Some(classifier) = &self.classifier else {
            warn!(node_id = %ctx.node_id(), "no classifier configured, falling back to rules");
            let out = fallback("no classifier configured".into());
            ctx.log(LogLevel::Warn, "AI condition fell back to rules: no classifier configured");
            return out;
        };

        let request = ClassificationRequest {
            prompt: render(ctx, cfg.ai_prompt.as_deref().unwrap_or_default()),
            message: ctx.message().map(str::to_string),
            variables: ctx.variables().all().clone(),
        };
        let started = Instant::now();
        let verdict = classifier.classify(&request).await;
        log_port_call(classifier.name(), ctx, verdict.is_ok(), started);

        match verdict {
            Ok(verdict) => {
                let threshold = cfg.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE);
                json!({
                    "result": verdict.result && verdict.confidence >= threshold,
                    "method": "ai",
                    "confidence": verdict.confidence,
                    "reasoning": verdict.reasoning,
                    "threshold": threshold,
                })
            }
            Err(e) => {
                warn!(node_id = %ctx.node_id(), "classifier failed, falling back to rules: {}", e);
                let out = fallback(e.to_string());
                ctx.log(LogLevel::Warn, format!("AI condition fell back to rules: {}", e));
                out
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn name(&self) -> &'static str {
        "condition"
    }

    #[tracing::instrument(name = "condition_node_execute", skip(self, ctx), fields(node_id = %ctx.node_id()))]
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: ConditionNodeConfig = ctx.config_as()?;
        let mode = cfg.mode.unwrap_or(self.default_mode);

        let mut output = match mode {
            EvaluationMode::Simple => {
                let (result, details) = evaluate_simple(&cfg.rules, &|f: &str| resolve_field(ctx, f));
                json!({ "result": result, "method": "simple", "details": details })
            }
            EvaluationMode::Advanced => {
                let (result, details) =
                    evaluate_advanced(&cfg.groups, cfg.groups_logical_operator, &|f: &str| resolve_field(ctx, f));
                json!({ "result": result, "method": "advanced", "details": details })
            }
            EvaluationMode::Ai => self.evaluate_ai(ctx, &cfg).await,
        };

        let result = output["result"].as_bool().unwrap_or(false);
        output["mode"] = json!(mode);
        ctx.log(
            LogLevel::Debug,
            format!("condition evaluated to {} ({:?} mode)", result, mode),
        );

        let next = if result { cfg.true_node_id } else { cfg.false_node_id };
        Ok(NodeResult::ok(output)
            .with_handle(if result { "true" } else { "false" })
            .with_next_opt(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::FlowNode;
    use crate::ports::{Classification, PortError};
    use serde_json::Map;

    fn rule(field: &str, operator: Operator, value: Value, op: LogicalOperator) -> ConditionRule {
        ConditionRule {
            id: None,
            field: field.into(),
            operator,
            value,
            logical_operator: op,
            enabled: true,
        }
    }

    fn vars(v: Value) -> impl Fn(&str) -> Option<Value> {
        let map: Map<String, Value> = v.as_object().cloned().unwrap();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn fold_uses_each_rules_own_operator() {
        // A(AND)=true, B(OR)=false, C(AND)=true → (true || false) && true
        let resolve = vars(json!({"a": 1, "b": 0, "c": 1}));
        let rules = vec![
            rule("a", Operator::Equals, json!(1), LogicalOperator::And),
            rule("b", Operator::Equals, json!(1), LogicalOperator::Or),
            rule("c", Operator::Equals, json!(1), LogicalOperator::And),
        ];
        let (result, details) = evaluate_simple(&rules, &resolve);
        assert!(result);
        assert_eq!(details.iter().map(|d| d.result).collect::<Vec<_>>(), vec![true, false, true]);

        // a trailing OR can still flip an earlier false
        let rules = vec![
            rule("b", Operator::Equals, json!(1), LogicalOperator::And),
            rule("a", Operator::Equals, json!(1), LogicalOperator::And),
            rule("a", Operator::Equals, json!(1), LogicalOperator::Or),
        ];
        assert!(evaluate_simple(&rules, &resolve).0);
    }

    #[test]
    fn no_rules_is_false() {
        let (result, details) = evaluate_simple(&[], &vars(json!({})));
        assert!(!result);
        assert!(details.is_empty());
    }

    #[test]
    fn operators_follow_coercion_rules() {
        assert!(evaluate_operator(Operator::Equals, Some(&json!(18)), &json!("18")));
        assert!(!evaluate_operator(Operator::Equals, None, &json!("")));
        assert!(evaluate_operator(Operator::Contains, Some(&json!("Quiero PRECIOS")), &json!("precio")));
        assert!(evaluate_operator(Operator::GreaterThan, Some(&json!("20")), &json!(18)));
        assert!(!evaluate_operator(Operator::GreaterThan, Some(&json!("veinte")), &json!(18)));
        assert!(evaluate_operator(Operator::LessThan, Some(&json!(3.5)), &json!("4")));
        assert!(evaluate_operator(Operator::IsEmpty, None, &Value::Null));
        assert!(evaluate_operator(Operator::IsEmpty, Some(&json!("")), &Value::Null));
        assert!(evaluate_operator(Operator::IsNotEmpty, Some(&json!("x")), &Value::Null));
        assert!(evaluate_operator(Operator::StartsWith, Some(&json!("Hola mundo")), &json!("hola")));
        assert!(evaluate_operator(Operator::RegexMatch, Some(&json!("ana@example.com")), &json!(r"^\S+@\S+$")));
        assert!(!evaluate_operator(Operator::Unknown, Some(&json!("x")), &json!("x")));
    }

    #[test]
    fn invalid_regex_is_false_not_an_error() {
        assert!(!evaluate_operator(Operator::RegexMatch, Some(&json!("abc")), &json!("([")));
    }

    #[test]
    fn unknown_operator_deserializes() {
        let rule: ConditionRule =
            serde_json::from_value(json!({"field": "a", "operator": "between", "value": 1})).unwrap();
        assert_eq!(rule.operator, Operator::Unknown);
        assert_eq!(rule.logical_operator, LogicalOperator::And);
    }

    #[test]
    fn advanced_groups_skip_disabled_entries() {
        let resolve = vars(json!({"plan": "pro", "seats": 3}));
        let groups: Vec<RuleGroup> = serde_json::from_value(json!([
            {"id": "g1", "logicalOperator": "AND", "rules": [
                {"field": "plan", "operator": "equals", "value": "pro"},
                {"field": "seats", "operator": "greater_than", "value": 10, "enabled": false}
            ]},
            {"id": "g2", "enabled": false, "rules": [
                {"field": "plan", "operator": "equals", "value": "free"}
            ]},
            {"id": "g3", "logicalOperator": "OR", "rules": [
                {"field": "seats", "operator": "less_than", "value": 1},
                {"field": "seats", "operator": "equals", "value": 3}
            ]}
        ]))
        .unwrap();

        let (result, details) = evaluate_advanced(&groups, LogicalOperator::And, &resolve);
        assert!(result);
        assert_eq!(details.len(), 2);

        let (none, _) = evaluate_advanced(&[], LogicalOperator::Or, &resolve);
        assert!(!none);
    }

    struct FixedClassifier(Result<Classification, PortError>);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _request: &ClassificationRequest) -> Result<Classification, PortError> {
            self.0.clone()
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn condition_ctx(config: Value) -> NodeContext {
        let mut ctx = NodeContext::dummy(FlowNode::new("cond", "condition", config))
            .with_message(Some("quiero comprar".into()));
        ctx.set_variable("age", json!(20));
        ctx
    }

    #[tokio::test]
    async fn routes_to_configured_branches() {
        let exec = ConditionExecutor::new(None);
        let mut ctx = condition_ctx(json!({
            "rules": [{"field": "age", "operator": "greater_than", "value": 18}],
            "trueNodeId": "adult",
            "falseNodeId": "minor"
        }));
        let result = exec.execute(&mut ctx).await.unwrap();
        assert_eq!(result.next_node_id.as_deref(), Some("adult"));
        assert_eq!(result.handle.as_deref(), Some("true"));
        assert_eq!(result.output["mode"], "simple");
    }

    #[tokio::test]
    async fn message_alias_resolves_user_text() {
        let exec = ConditionExecutor::new(None);
        let mut ctx = condition_ctx(json!({
            "rules": [{"field": "userMessage", "operator": "contains", "value": "COMPRAR"}]
        }));
        let result = exec.execute(&mut ctx).await.unwrap();
        assert!(result.next_node_id.is_none());
        assert_eq!(result.handle.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn ai_mode_uses_classifier_with_threshold() {
        let classifier = Arc::new(FixedClassifier(Ok(Classification {
            result: true,
            confidence: 0.4,
            reasoning: None,
        })));
        let exec = ConditionExecutor::new(Some(classifier)).with_mode(EvaluationMode::Ai);

        let mut ctx = condition_ctx(json!({"aiPrompt": "wants to buy?", "confidenceThreshold": 0.3}));
        let result = exec.execute(&mut ctx).await.unwrap();
        assert_eq!(result.output["method"], "ai");
        assert_eq!(result.handle.as_deref(), Some("true"));

        let mut ctx = condition_ctx(json!({"aiPrompt": "wants to buy?"}));
        let result = exec.execute(&mut ctx).await.unwrap();
        assert_eq!(result.handle.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn ai_failure_falls_back_to_rules() {
        let classifier = Arc::new(FixedClassifier(Err(PortError::Timeout("slow".into()))));
        let exec = ConditionExecutor::new(Some(classifier)).with_mode(EvaluationMode::Ai);
        let mut ctx = condition_ctx(json!({
            "rules": [{"field": "age", "operator": "greater_than", "value": 18}],
            "trueNodeId": "yes"
        }));

        let result = exec.execute(&mut ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["method"], "simple_fallback");
        assert_eq!(result.next_node_id.as_deref(), Some("yes"));
        assert!(ctx.logs().iter().any(|l| l.level == LogLevel::Warn));
    }

    #[tokio::test]
    async fn explicit_mode_overrides_executor_default() {
        let exec = ConditionExecutor::new(None).with_mode(EvaluationMode::Advanced);
        let mut ctx = condition_ctx(json!({
            "mode": "simple",
            "rules": [{"field": "age", "operator": "less_than", "value": 18}]
        }));
        let result = exec.execute(&mut ctx).await.unwrap();
        assert_eq!(result.output["mode"], "simple");
        assert_eq!(result.handle.as_deref(), Some("false"));
    }
}
