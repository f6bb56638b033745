//! Span data model.
//!
//! Ids are stored as integers and rendered as lowercase hex wherever they are
//! displayed or serialized. Tags are an ordered list; lookups return the first
//! match, and the attribute stage is the only place that rewrites them.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::{Duration, SystemTime};

/// 128-bit trace identifier, split into two 64-bit halves.
///
/// All spans of one logical request share a trace id, and sampling decisions
/// are keyed on it rather than on the span id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// A trace id with both halves zero is invalid and must never be exported.
    pub const fn is_valid(&self) -> bool {
        self.high != 0 || self.low != 0
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        Self {
            high: (value >> 64) as u64,
            low: value as u64,
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == 0 {
            write!(f, "{:016x}", self.low)
        } else {
            write!(f, "{:016x}{:016x}", self.high, self.low)
        }
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 64-bit span identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub u64);

impl SpanId {
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Typed tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum TagValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Binary(Vec<u8>),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

/// A key paired with exactly one typed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tag {
    pub key: String,
    #[serde(flatten)]
    pub value: TagValue,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            TagValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.value {
            TagValue::Int64(v) => Some(v),
            _ => None,
        }
    }
}

/// Structured log event recorded within a span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Log {
    pub timestamp: SystemTime,
    pub fields: Vec<Tag>,
}

/// The process/service that emitted a span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<Tag>,
}

impl Process {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            tags: Vec::new(),
        }
    }
}

/// Relationship kind between two spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    ChildOf,
    FollowsFrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpanReference {
    pub ref_type: RefType,
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// Represents a single unit of work in a distributed trace.
///
/// Created once by the boundary receiver. Only the tag list is rewritten
/// afterwards, and only by the stage that currently owns the span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub operation_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<SpanReference>,
    pub flags: u32,
    pub start_time: SystemTime,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<Log>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Span {
    /// Creates a root span starting now with zero duration and no tags.
    pub fn new(trace_id: impl Into<TraceId>, span_id: u64, operation_name: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: SpanId(span_id),
            parent_span_id: None,
            operation_name: operation_name.into(),
            references: Vec::new(),
            flags: 0,
            start_time: SystemTime::now(),
            duration: Duration::ZERO,
            tags: Vec::new(),
            logs: Vec::new(),
            process: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: u64) -> Self {
        let parent = SpanId(parent);
        self.parent_span_id = Some(parent);
        self.references.push(SpanReference {
            ref_type: RefType::ChildOf,
            trace_id: self.trace_id,
            span_id: parent,
        });
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.process = Some(process);
        self
    }

    /// Returns the first tag with the given key.
    pub fn tag(&self, key: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.key == key)
    }

    /// Position of the first tag with the given key.
    pub fn tag_index(&self, key: &str) -> Option<usize> {
        self.tags.iter().position(|t| t.key == key)
    }

    pub fn end_time(&self) -> SystemTime {
        self.start_time + self.duration
    }
}
