//! Typed envelopes carried through the handler pipeline.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::benchmark::BenchmarkInfo;
use crate::monitor::MonitorKind;

/// A single sampled value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Sum of two numeric values. Integers stay integers; mixing with a float
    /// yields a float. Text cannot be summed.
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(Self::Int(a.saturating_add(*b))),
            (Self::Int(a), Self::Float(b)) => Some(Self::Float(*a as f64 + b)),
            (Self::Float(a), Self::Int(b)) => Some(Self::Float(a + *b as f64)),
            (Self::Float(a), Self::Float(b)) => Some(Self::Float(a + b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// Named values in insertion order. The order is what CSV columns follow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Set `name` to `value`. An existing field keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// Sampled data: one record, or one record per CPU socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Record(Record),
    PerSocket(Vec<Record>),
}

impl Payload {
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            Self::PerSocket(_) => None,
        }
    }

    pub fn as_per_socket(&self) -> Option<&[Record]> {
        match self {
            Self::PerSocket(r) => Some(r),
            Self::Record(_) => None,
        }
    }
}

/// Who produced a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Monitor(MonitorKind),
    Handler(String),
}

/// Non-owning handle to the benchmark a message belongs to.
pub type BenchmarkRef = Weak<BenchmarkInfo>;

#[derive(Debug, Clone)]
pub enum MessageKind {
    /// Raw monitor output with no benchmark attached.
    Monitored,
    /// Monitor output scoped to a running benchmark.
    PerBench(BenchmarkRef),
    /// Output meant for persistence only.
    Persistable,
    /// A finished record ready for the outbound queue.
    Routable { routing_key: String },
}

impl PartialEq for MessageKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Monitored, Self::Monitored) => true,
            (Self::PerBench(a), Self::PerBench(b)) => Weak::ptr_eq(a, b),
            (Self::Persistable, Self::Persistable) => true,
            (Self::Routable { routing_key: a }, Self::Routable { routing_key: b }) => a == b,
            _ => false,
        }
    }
}

/// Immutable envelope for sampled data. Handlers build new messages rather
/// than changing the ones they receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Payload,
    source: Source,
    kind: MessageKind,
}

impl Message {
    pub fn new(payload: Payload, source: Source, kind: MessageKind) -> Self {
        Self {
            payload,
            source,
            kind,
        }
    }

    pub fn monitored(source: Source, payload: Payload) -> Self {
        Self::new(payload, source, MessageKind::Monitored)
    }

    pub fn per_bench(source: Source, payload: Payload, benchmark: &Arc<BenchmarkInfo>) -> Self {
        Self::new(payload, source, MessageKind::PerBench(Arc::downgrade(benchmark)))
    }

    pub fn persistable(source: Source, payload: Payload) -> Self {
        Self::new(payload, source, MessageKind::Persistable)
    }

    pub fn routable(source: Source, payload: Payload, routing_key: impl Into<String>) -> Self {
        Self::new(
            payload,
            source,
            MessageKind::Routable {
                routing_key: routing_key.into(),
            },
        )
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The monitor variant that produced this message, if any.
    pub fn monitor_kind(&self) -> Option<MonitorKind> {
        match self.source {
            Source::Monitor(kind) => Some(kind),
            Source::Handler(_) => None,
        }
    }

    /// The owning benchmark, if the message is benchmark scoped and the
    /// benchmark is still alive.
    pub fn benchmark(&self) -> Option<Arc<BenchmarkInfo>> {
        match &self.kind {
            MessageKind::PerBench(bench) => bench.upgrade(),
            _ => None,
        }
    }

    pub fn routing_key(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Routable { routing_key } => Some(routing_key),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}
