//! Export decoration: an ordered chain of filter stages run over every record
//! before it reaches the exporter.
//!
//! Stages run in registration order. The first stage that drops a record
//! ends its journey; later stages never see it. The chain is frozen by
//! `build()` and shared read-only across flush cycles.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::attributes::AttributeValue;
use super::exporter::{ExportSummary, SpanExporter};
use super::span::SpanRecord;
use crate::error::{AgentError, AgentResult};

/// What a stage decided about a record.
#[derive(Debug)]
pub enum FilterOutcome {
    /// Pass the (possibly modified) record on
    Keep(SpanRecord),
    Drop,
}

pub trait FilterStage: Send + Sync {
    fn name(&self) -> &str;

    /// Checked once at registration; a failing stage never joins a chain.
    fn validate(&self) -> AgentResult<()> {
        Ok(())
    }

    fn apply(&self, record: SpanRecord) -> FilterOutcome;
}

/// How a span name is matched.
#[derive(Debug, Clone)]
pub enum NameMatcher {
    Exact(String),
    Pattern(Regex),
}

impl NameMatcher {
    pub fn pattern(raw: &str) -> AgentResult<Self> {
        Regex::new(raw)
            .map(NameMatcher::Pattern)
            .map_err(|e| AgentError::invalid_stage("reject_name_pattern", e.to_string()))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Exact(expected) => expected == name,
            NameMatcher::Pattern(re) => re.is_match(name),
        }
    }
}

/// Drops spans whose name matches.
pub struct RejectByName {
    matcher: NameMatcher,
}

impl RejectByName {
    pub fn new(matcher: NameMatcher) -> Self {
        Self { matcher }
    }
}

impl FilterStage for RejectByName {
    fn name(&self) -> &str {
        "reject_name"
    }

    fn validate(&self) -> AgentResult<()> {
        match &self.matcher {
            NameMatcher::Exact(name) if name.is_empty() => {
                Err(AgentError::invalid_stage(self.name(), "span name must not be empty"))
            }
            _ => Ok(()),
        }
    }

    fn apply(&self, record: SpanRecord) -> FilterOutcome {
        if self.matcher.matches(&record.name) {
            FilterOutcome::Drop
        } else {
            FilterOutcome::Keep(record)
        }
    }
}

/// Drops spans carrying `key` with exactly `value`.
pub struct RejectByAttributeValue {
    key: String,
    value: AttributeValue,
}

impl RejectByAttributeValue {
    pub fn new(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl FilterStage for RejectByAttributeValue {
    fn name(&self) -> &str {
        "reject_attribute_value"
    }

    fn validate(&self) -> AgentResult<()> {
        require_key(self.name(), &self.key)
    }

    fn apply(&self, record: SpanRecord) -> FilterOutcome {
        if record.attributes.get(&self.key) == Some(&self.value) {
            FilterOutcome::Drop
        } else {
            FilterOutcome::Keep(record)
        }
    }
}

/// Removes an attribute, optionally only when it has a given value.
pub struct RemoveAttribute {
    key: String,
    only_if: Option<AttributeValue>,
}

impl RemoveAttribute {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            only_if: None,
        }
    }

    pub fn when_equal(mut self, value: impl Into<AttributeValue>) -> Self {
        self.only_if = Some(value.into());
        self
    }
}

impl FilterStage for RemoveAttribute {
    fn name(&self) -> &str {
        "remove_attribute"
    }

    fn validate(&self) -> AgentResult<()> {
        require_key(self.name(), &self.key)
    }

    fn apply(&self, mut record: SpanRecord) -> FilterOutcome {
        let remove = match (&self.only_if, record.attributes.get(&self.key)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => expected == actual,
        };
        if remove {
            record.attributes.remove(&self.key);
        }
        FilterOutcome::Keep(record)
    }
}

/// Overwrites an attribute's value when present (redaction).
pub struct ReplaceAttribute {
    key: String,
    replacement: AttributeValue,
}

impl ReplaceAttribute {
    pub fn new(key: impl Into<String>, replacement: impl Into<AttributeValue>) -> Self {
        Self {
            key: key.into(),
            replacement: replacement.into(),
        }
    }
}

impl FilterStage for ReplaceAttribute {
    fn name(&self) -> &str {
        "replace_attribute"
    }

    fn validate(&self) -> AgentResult<()> {
        require_key(self.name(), &self.key)
    }

    fn apply(&self, mut record: SpanRecord) -> FilterOutcome {
        if let Some(value) = record.attributes.get_mut(&self.key) {
            *value = self.replacement.clone();
        }
        FilterOutcome::Keep(record)
    }
}

/// A stage backed by a closure, for application-specific logic.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F>
where
    F: Fn(SpanRecord) -> FilterOutcome + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> FilterStage for FnStage<F>
where
    F: Fn(SpanRecord) -> FilterOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> AgentResult<()> {
        require_key("fn_stage", &self.name)
    }

    fn apply(&self, record: SpanRecord) -> FilterOutcome {
        (self.f)(record)
    }
}

fn require_key(stage: &str, key: &str) -> AgentResult<()> {
    if key.trim().is_empty() {
        Err(AgentError::invalid_stage(stage, "key must not be empty"))
    } else {
        Ok(())
    }
}

/// Declarative form of the built-in stages, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterRule {
    RejectName {
        name: String,
    },
    RejectNamePattern {
        pattern: String,
    },
    RejectAttributeValue {
        key: String,
        value: AttributeValue,
    },
    RemoveAttribute {
        key: String,
        #[serde(default)]
        value: Option<AttributeValue>,
    },
    ReplaceAttribute {
        key: String,
        value: AttributeValue,
    },
}

impl FilterRule {
    pub fn into_stage(self) -> AgentResult<Box<dyn FilterStage>> {
        let stage: Box<dyn FilterStage> = match self {
            FilterRule::RejectName { name } => Box::new(RejectByName::new(NameMatcher::Exact(name))),
            FilterRule::RejectNamePattern { pattern } => {
                Box::new(RejectByName::new(NameMatcher::pattern(&pattern)?))
            }
            FilterRule::RejectAttributeValue { key, value } => {
                Box::new(RejectByAttributeValue::new(key, value))
            }
            FilterRule::RemoveAttribute { key, value } => {
                let stage = RemoveAttribute::new(key);
                Box::new(match value {
                    Some(v) => stage.when_equal(v),
                    None => stage,
                })
            }
            FilterRule::ReplaceAttribute { key, value } => Box::new(ReplaceAttribute::new(key, value)),
        };
        Ok(stage)
    }
}

/// Collects stages in order. Invalid stages are rejected here, before any
/// pipeline sees them.
#[derive(Default)]
pub struct ExportDecorationChainBuilder {
    stages: Vec<Box<dyn FilterStage>>,
}

impl ExportDecorationChainBuilder {
    pub fn stage<S: FilterStage + 'static>(&mut self, stage: S) -> AgentResult<&mut Self> {
        self.push(Box::new(stage))
    }

    pub fn rule(&mut self, rule: FilterRule) -> AgentResult<&mut Self> {
        let stage = rule.into_stage()?;
        self.push(stage)
    }

    pub fn rules<I>(&mut self, rules: I) -> AgentResult<&mut Self>
    where
        I: IntoIterator<Item = FilterRule>,
    {
        for rule in rules {
            self.rule(rule)?;
        }
        Ok(self)
    }

    pub fn reject_spans_by_name(&mut self, name: impl Into<String>) -> AgentResult<&mut Self> {
        self.stage(RejectByName::new(NameMatcher::Exact(name.into())))
    }

    pub fn remove_span_attribute(&mut self, key: impl Into<String>) -> AgentResult<&mut Self> {
        self.stage(RemoveAttribute::new(key))
    }

    pub fn replace_span_attribute(
        &mut self,
        key: impl Into<String>,
        replacement: impl Into<AttributeValue>,
    ) -> AgentResult<&mut Self> {
        self.stage(ReplaceAttribute::new(key, replacement))
    }

    /// Move `other`'s stages, already validated, after this builder's own.
    pub fn append(&mut self, other: ExportDecorationChainBuilder) -> &mut Self {
        self.stages.extend(other.stages);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn build(self) -> ExportDecorationChain {
        ExportDecorationChain {
            stages: Arc::from(self.stages),
        }
    }

    fn push(&mut self, stage: Box<dyn FilterStage>) -> AgentResult<&mut Self> {
        stage.validate()?;
        log::debug!("[EXPORT] Registered filter stage #{}: {}", self.stages.len(), stage.name());
        self.stages.push(stage);
        Ok(self)
    }
}

/// Immutable, ordered filter chain.
#[derive(Clone, Default)]
pub struct ExportDecorationChain {
    stages: Arc<[Box<dyn FilterStage>]>,
}

impl fmt::Debug for ExportDecorationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl ExportDecorationChain {
    pub fn builder() -> ExportDecorationChainBuilder {
        ExportDecorationChainBuilder::default()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `record` through every stage; `None` means some stage dropped it.
    pub fn apply(&self, record: SpanRecord) -> Option<SpanRecord> {
        let mut current = record;
        for stage in self.stages.iter() {
            match stage.apply(current) {
                FilterOutcome::Keep(next) => current = next,
                FilterOutcome::Drop => return None,
            }
        }
        Some(current)
    }

    /// Decorate `exporter` so every batch is filtered first.
    pub fn wrap(&self, exporter: Arc<dyn SpanExporter>) -> FilteringExporter {
        FilteringExporter {
            chain: self.clone(),
            inner: exporter,
        }
    }
}

/// An exporter that filters each batch through a chain before delegating.
pub struct FilteringExporter {
    chain: ExportDecorationChain,
    inner: Arc<dyn SpanExporter>,
}

#[async_trait]
impl SpanExporter for FilteringExporter {
    async fn export(&self, batch: Vec<SpanRecord>) -> AgentResult<ExportSummary> {
        let processed = batch.len();
        let kept: Vec<SpanRecord> = batch
            .into_iter()
            .filter_map(|record| self.chain.apply(record))
            .collect();
        let dropped = processed - kept.len();

        if kept.is_empty() {
            return Ok(ExportSummary {
                processed,
                exported: 0,
                dropped,
            });
        }

        let delegated = self.inner.export(kept).await?;
        Ok(ExportSummary {
            processed,
            exported: delegated.exported,
            dropped: dropped + delegated.dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::attributes::Attributes;
    use crate::telemetry::session::SessionId;
    use crate::telemetry::span::Span;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(name: &str, attrs: &[(&str, &str)]) -> SpanRecord {
        let mut span = Span::event(name);
        for (k, v) in attrs {
            span.set_attribute(*k, *v);
        }
        SpanRecord::stamp(span, SessionId::from("s"), &Attributes::new())
    }

    fn health_then_pii() -> ExportDecorationChain {
        let mut builder = ExportDecorationChain::builder();
        builder
            .reject_spans_by_name("health")
            .unwrap()
            .remove_span_attribute("pii")
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_drop_by_name() {
        let chain = health_then_pii();
        assert!(chain.apply(record("health", &[("pii", "x")])).is_none());
    }

    #[test]
    fn test_redact_leaves_everything_else() {
        let chain = health_then_pii();
        let input = record("click", &[("pii", "alice@example.com"), ("screen", "cart")]);

        let output = chain.apply(input.clone()).unwrap();
        assert!(output.attribute("pii").is_none());

        let mut expected = input;
        expected.attributes.remove("pii");
        assert_eq!(output, expected);
    }

    #[test]
    fn test_stages_run_in_registration_order_and_short_circuit() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let later_seen = Arc::new(AtomicUsize::new(0));

        let first_calls = calls.clone();
        let second_calls = calls.clone();
        let seen = later_seen.clone();

        let mut builder = ExportDecorationChain::builder();
        builder
            .stage(FnStage::new("first", move |r: SpanRecord| {
                first_calls.lock().push("first");
                FilterOutcome::Keep(r)
            }))
            .unwrap()
            .stage(FnStage::new("dropper", move |r: SpanRecord| {
                second_calls.lock().push("dropper");
                if r.name == "noise" {
                    FilterOutcome::Drop
                } else {
                    FilterOutcome::Keep(r)
                }
            }))
            .unwrap()
            .stage(FnStage::new("last", move |r: SpanRecord| {
                seen.fetch_add(1, Ordering::SeqCst);
                FilterOutcome::Keep(r)
            }))
            .unwrap();
        let chain = builder.build();

        assert_eq!(chain.stage_names(), vec!["first", "dropper", "last"]);
        assert!(chain.apply(record("noise", &[])).is_none());
        assert_eq!(*calls.lock(), vec!["first", "dropper"]);
        assert_eq!(later_seen.load(Ordering::SeqCst), 0);

        assert!(chain.apply(record("signal", &[])).is_some());
        assert_eq!(later_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_stages_rejected_at_registration() {
        let mut builder = ExportDecorationChain::builder();
        assert!(matches!(
            builder.remove_span_attribute(""),
            Err(AgentError::InvalidFilterStage { .. })
        ));
        assert!(builder.rule(FilterRule::RejectNamePattern { pattern: "(".into() }).is_err());
        assert!(builder.reject_spans_by_name("").is_err());
        assert!(builder.is_empty());
    }

    #[test]
    fn test_rules_compile_in_order() {
        let rules = vec![
            FilterRule::ReplaceAttribute {
                key: "user.email".into(),
                value: "redacted".into(),
            },
            FilterRule::RejectAttributeValue {
                key: "user.email".into(),
                value: "redacted".into(),
            },
        ];
        let mut builder = ExportDecorationChain::builder();
        builder.rules(rules).unwrap();
        let chain = builder.build();

        // replace runs first, so the reject stage sees the redacted value
        assert!(chain.apply(record("login", &[("user.email", "a@b.c")])).is_none());
        assert!(chain.apply(record("login", &[])).is_some());
    }

    #[test]
    fn test_pattern_and_conditional_remove() {
        let mut builder = ExportDecorationChain::builder();
        builder
            .rule(FilterRule::RejectNamePattern { pattern: "^debug\\.".into() })
            .unwrap()
            .rule(FilterRule::RemoveAttribute {
                key: "token".into(),
                value: Some("secret".into()),
            })
            .unwrap();
        let chain = builder.build();

        assert!(chain.apply(record("debug.frame", &[])).is_none());
        let kept = chain.apply(record("tap", &[("token", "public")])).unwrap();
        assert_eq!(kept.attribute("token"), Some(&AttributeValue::from("public")));
        let redacted = chain.apply(record("tap", &[("token", "secret")])).unwrap();
        assert!(redacted.attribute("token").is_none());
    }

    #[derive(Default)]
    struct Capture {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl SpanExporter for Capture {
        async fn export(&self, batch: Vec<SpanRecord>) -> AgentResult<ExportSummary> {
            let count = batch.len();
            self.batches
                .lock()
                .push(batch.into_iter().map(|r| r.name).collect());
            Ok(ExportSummary::all(count))
        }
    }

    #[tokio::test]
    async fn test_wrapped_exporter_omits_dropped_but_counts_them() {
        let capture = Arc::new(Capture::default());
        let exporter = health_then_pii().wrap(capture.clone());

        let batch = vec![
            record("click", &[]),
            record("health", &[]),
            record("scroll", &[]),
        ];
        let summary = exporter.export(batch).await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.exported, 2);
        assert_eq!(summary.dropped, 1);
        assert_eq!(*capture.batches.lock(), vec![vec!["click", "scroll"]]);
    }

    #[tokio::test]
    async fn test_fully_filtered_batch_skips_delegate() {
        let capture = Arc::new(Capture::default());
        let exporter = health_then_pii().wrap(capture.clone());

        let summary = exporter.export(vec![record("health", &[])]).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.exported, 0);
        assert!(capture.batches.lock().is_empty());
    }

    #[test]
    fn test_rule_deserializes_from_json() {
        let rule: FilterRule =
            serde_json::from_str(r#"{"kind":"reject_attribute_value","key":"env","value":"test"}"#)
                .unwrap();
        assert_eq!(
            rule,
            FilterRule::RejectAttributeValue {
                key: "env".into(),
                value: "test".into()
            }
        );
    }
}
