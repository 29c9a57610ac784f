//! The per-resource ledger and its JSON representation.
//!
//! A ledger is a single JSON object:
//!
//! ```json
//! {
//!   "url": "https://example.com/v/1",
//!   "title": "anything else is kept verbatim",
//!   "default_tasks": {
//!     "perform_download": "/media/2025-03-18/1.mp4",
//!     "apply_watermark": true,
//!     "make_clips": false
//!   }
//! }
//! ```
//!
//! Each entry of `default_tasks` is decoded into a [`TaskState`]: `false` is
//! disabled, `true` is pending, a string is the output path of a completed
//! run. Anything else is kept as-is and never acted upon.
use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::task::{Registry, TaskKind};

/// Key of the task map inside a ledger file.
pub(crate) const TASKS_KEY: &str = "default_tasks";

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    /// The task will not run automatically.
    Disabled,
    /// The task is enabled and has not produced output yet.
    Pending,
    /// The task ran and left an artifact at this path.
    Completed(Utf8PathBuf),
    /// A value that is neither a flag nor a path.
    Unrecognized(Value),
}

impl TaskState {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            TaskState::Pending
        } else {
            TaskState::Disabled
        }
    }

    pub fn output(&self) -> Option<&Utf8Path> {
        match self {
            TaskState::Completed(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }
}

impl From<Value> for TaskState {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(flag) => TaskState::from_flag(flag),
            Value::String(path) => TaskState::Completed(path.into()),
            other => TaskState::Unrecognized(other),
        }
    }
}

impl From<&TaskState> for Value {
    fn from(state: &TaskState) -> Self {
        match state {
            TaskState::Disabled => Value::Bool(false),
            TaskState::Pending => Value::Bool(true),
            TaskState::Completed(path) => Value::String(path.to_string()),
            TaskState::Unrecognized(value) => value.clone(),
        }
    }
}

impl Serialize for TaskState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(TaskState::from)
    }
}

/// Decodes the task map. A `null` or any other non-object value reads as an
/// empty map, so the record itself stays usable.
fn lenient_tasks<'de, D>(deserializer: D) -> Result<BTreeMap<String, TaskState>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(name, value)| (name, TaskState::from(value)))
            .collect()),
        Value::Null => Ok(BTreeMap::new()),
        other => {
            tracing::warn!(value = %other, "task map is not an object, reading it as empty");
            Ok(BTreeMap::new())
        }
    }
}

/// The persisted record of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLedger {
    /// Unique key of the resource within a store.
    pub url: String,
    /// Task states by task name. Names the registry doesn't know are kept.
    #[serde(rename = "default_tasks", default, deserialize_with = "lenient_tasks")]
    pub tasks: BTreeMap<String, TaskState>,
    /// Descriptive fields (title, uploader, upload date, ...), opaque here.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResourceLedger {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tasks: BTreeMap::new(),
            fields: Map::new(),
        }
    }

    pub fn state(&self, task: &str) -> Option<&TaskState> {
        self.tasks.get(task)
    }

    pub fn set_state(&mut self, kind: TaskKind, state: TaskState) {
        self.tasks.insert(kind.name().to_string(), state);
    }

    pub fn record_completion(&mut self, kind: TaskKind, output: impl Into<Utf8PathBuf>) {
        self.set_state(kind, TaskState::Completed(output.into()));
    }

    /// Writes the default flag of every registered task that is missing from
    /// this ledger. Existing entries are never touched. Returns the number of
    /// entries added.
    pub fn add_defaults(&mut self, registry: &Registry) -> usize {
        let mut added = 0;

        for task in registry.tasks() {
            if !self.tasks.contains_key(task.name()) {
                self.tasks.insert(
                    task.name().to_string(),
                    TaskState::from_flag(task.default_enabled),
                );
                added += 1;
            }
        }

        added
    }

    /// Merges descriptive fields into the ledger. The resource key and the
    /// task map can't be overwritten this way.
    pub fn merge_fields(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            if key == "url" || key == TASKS_KEY {
                tracing::debug!(field = %key, "ignoring reserved field in capability result");
                continue;
            }
            self.fields.insert(key, value);
        }
    }

    /// Names of task entries the registry doesn't recognize.
    pub fn unknown_tasks(&self) -> impl Iterator<Item = &str> {
        self.tasks
            .keys()
            .map(String::as_str)
            .filter(|name| name.parse::<TaskKind>().is_err())
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
