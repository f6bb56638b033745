//! Attribute stage: ordered tag mutations.

use crate::config::AttributesConfig;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{forward, next_item, ItemStream, Processor};
use crate::span::{Span, Tag, TagValue};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a rule does to its key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "lowercase")]
pub enum AttributeAction {
    /// Add the tag only if the key is absent
    Insert(TagValue),
    /// Overwrite the first matching tag only if the key is present
    Update(TagValue),
    /// Insert or update
    Upsert(TagValue),
    /// Remove the first matching tag
    Delete,
}

/// One mutation applied to every span.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttributeRule {
    pub key: String,
    #[serde(flatten)]
    pub action: AttributeAction,
}

impl AttributeRule {
    pub fn insert(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            action: AttributeAction::Insert(value.into()),
        }
    }

    pub fn update(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            action: AttributeAction::Update(value.into()),
        }
    }

    pub fn upsert(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            action: AttributeAction::Upsert(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action: AttributeAction::Delete,
        }
    }

    /// Applies the rule to `span`. A missing (insert: present) target is a no-op.
    pub fn apply(&self, span: &mut Span) {
        let existing = span.tag_index(&self.key);
        match (&self.action, existing) {
            (AttributeAction::Insert(value), None) | (AttributeAction::Upsert(value), None) => {
                span.tags.push(Tag::new(self.key.clone(), value.clone()));
            }
            (AttributeAction::Update(value), Some(i)) | (AttributeAction::Upsert(value), Some(i)) => {
                span.tags[i].value = value.clone();
            }
            (AttributeAction::Delete, Some(i)) => {
                span.tags.remove(i);
            }
            _ => {}
        }
    }
}

/// Applies every rule, in order, to one span.
pub fn apply_rules(rules: &[AttributeRule], span: &mut Span) {
    for rule in rules {
        rule.apply(span);
    }
}

/// Rewrites span tags in place as spans pass through.
pub struct AttributesProcessor {
    name: String,
    rules: Arc<[AttributeRule]>,
    queue_size: usize,
    metrics: Arc<PipelineMetrics>,
}

impl AttributesProcessor {
    pub fn new(config: AttributesConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            name: config.name,
            rules: config.actions.into(),
            queue_size: config.queue_size,
            metrics,
        }
    }

    pub fn rules(&self) -> &[AttributeRule] {
        &self.rules
    }
}

impl Processor<Span> for AttributesProcessor {
    fn process(&self, mut input: ItemStream<Span>, cancel: CancellationToken) -> ItemStream<Span> {
        let (tx, rx) = mpsc::channel(self.queue_size.max(1));
        let rules = Arc::clone(&self.rules);
        let metrics = Arc::clone(&self.metrics);
        let name = self.name.clone();

        tokio::spawn(async move {
            while let Some(mut span) = next_item(&mut input, &cancel).await {
                let started = Instant::now();
                apply_rules(&rules, &mut span);
                metrics.record_processing_time(started.elapsed());

                if !forward(&tx, span, &cancel).await {
                    break;
                }
            }
            debug!("Attribute stage {} finished", name);
        });

        rx
    }

    fn name(&self) -> &str {
        &self.name
    }
}
