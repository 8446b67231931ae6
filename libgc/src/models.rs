use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Finalizer asking the collector to detach every dependent before the
/// owner goes away.
pub const ORPHAN_FINALIZER: &str = "orphan";
/// Finalizer set by a foreground delete: the owner stays until every
/// blocking dependent is gone.
pub const FOREGROUND_FINALIZER: &str = "foregroundDeletion";

/// Unique id of an object. Never reused, so it is the graph key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Uid(uid.into())
    }

    pub fn generate() -> Self {
        Uid(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Uid(s.to_string())
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Uid(s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    /// If true, the owner cannot be removed from the store until this
    /// reference is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    pub fn blocks_owner_deletion(&self) -> bool {
        self.block_owner_deletion.unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uid,
    /// Opaque optimistic-concurrency token assigned by the store.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Metadata-only view of a stored object.
///
/// Only the type and object metadata are interpreted; spec, status and any
/// other top-level field are carried in `rest` untouched so that an update
/// written back by the collector does not lose them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl Object {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Object {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..Default::default()
            },
            rest: serde_json::Map::new(),
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.metadata.uid
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        &self.metadata.owner_references
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
            uid: self.metadata.uid.clone(),
        }
    }

    /// Builds the bare object a virtual delete event carries.
    pub fn from_reference(reference: &ObjectReference) -> Self {
        let mut obj = Object::new(
            &reference.api_version,
            &reference.kind,
            &reference.namespace,
            &reference.name,
        );
        obj.metadata.uid = reference.uid.clone();
        obj
    }
}

/// Identity of one object: what the graph keys on and what store requests
/// are built from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Owner references carry no namespace; a referenced owner inherits the
    /// namespace of the dependent naming it.
    pub namespace: String,
    pub uid: Uid,
}

impl ObjectReference {
    pub fn from_owner(owner: &OwnerReference, namespace: &str) -> Self {
        ObjectReference {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            namespace: namespace.to_string(),
            uid: owner.uid.clone(),
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}, namespace: {}, name: {}, uid: {}]",
            self.api_version, self.kind, self.namespace, self.name, self.uid
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

/// A change to one object, as fed to the propagator.
#[derive(Clone, Debug)]
pub struct Event {
    pub event_type: EventType,
    pub object: Object,
    /// Last known state before an update, when the monitor has one.
    pub old_object: Option<Object>,
}

impl Event {
    pub fn add(object: Object) -> Self {
        Event {
            event_type: EventType::Add,
            object,
            old_object: None,
        }
    }

    pub fn update(old_object: Object, object: Object) -> Self {
        Event {
            event_type: EventType::Update,
            object,
            old_object: Some(old_object),
        }
    }

    pub fn delete(object: Object) -> Self {
        Event {
            event_type: EventType::Delete,
            object,
            old_object: None,
        }
    }

    /// True when this event is where the object's deletion timestamp goes
    /// from unset to set. A missing old object counts as not yet deleting.
    pub fn deletion_starts(&self) -> bool {
        if !self.object.is_being_deleted() {
            return false;
        }
        match &self.old_object {
            None => true,
            Some(old) => !old.is_being_deleted(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// Whatever the object's finalizers already ask for.
    #[default]
    Default,
    Orphan,
    Background,
    Foreground,
}
