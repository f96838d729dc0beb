//! Feather (class definition) data model

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the root feather every other feather inherits from
pub const OBJECT: &str = "Object";
/// Name of the built-in change log feather
pub const LOG: &str = "Log";

/// A declarative class definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feather {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parent feather; `None` means `Object` (or nothing, for `Object` itself)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<String>,
    #[serde(default)]
    pub is_child: bool,
    #[serde(default)]
    pub is_read_only: bool,
    /// Collection name; enables list queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Default grant applied when the feather is saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<DefaultAuthorization>,
    #[serde(default)]
    pub properties: IndexMap<String, PropertySpec>,
}

impl Feather {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inherits: None,
            is_child: false,
            is_read_only: false,
            plural: None,
            module: None,
            authorization: None,
            properties: IndexMap::new(),
        }
    }

    pub fn inherits(mut self, parent: impl Into<String>) -> Self {
        self.inherits = Some(parent.into());
        self
    }

    pub fn plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = Some(plural.into());
        self
    }

    pub fn child(mut self) -> Self {
        self.is_child = true;
        self
    }

    pub fn property(mut self, name: impl Into<String>, spec: PropertySpec) -> Self {
        self.properties.insert(name.into(), spec);
        self
    }

    /// Effective parent name, `None` only for `Object`
    pub fn parent(&self) -> Option<&str> {
        if self.name == OBJECT {
            None
        } else {
            Some(self.inherits.as_deref().unwrap_or(OBJECT))
        }
    }

    /// Whether the feather declares an etag-style concurrency token
    pub fn has_etag(&self) -> bool {
        self.properties.contains_key("etag")
    }
}

/// Grant written for a feather when it is saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultAuthorization {
    pub role: String,
    #[serde(flatten)]
    pub grant: Grant,
}

/// Per-action permissions; `None` means "no opinion at this level"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_create: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_delete: Option<bool>,
}

impl Grant {
    pub fn all() -> Self {
        Self {
            can_create: Some(true),
            can_read: Some(true),
            can_update: Some(true),
            can_delete: Some(true),
        }
    }

    pub fn read_only() -> Self {
        Self {
            can_read: Some(true),
            ..Self::default()
        }
    }
}

/// A named, typed attribute of a feather
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySpec {
    #[serde(rename = "type")]
    pub kind: PropertyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonumber: Option<Autonumber>,
    /// Ancestor that declared the property; set by resolution only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherited_from: Option<String>,
}

impl PropertySpec {
    pub fn of(kind: PropertyType) -> Self {
        Self {
            kind,
            format: None,
            description: None,
            default: None,
            is_required: false,
            is_unique: false,
            is_read_only: false,
            autonumber: None,
            inherited_from: None,
        }
    }

    pub fn string() -> Self {
        Self::of(PropertyType::Primitive(Primitive::String))
    }

    pub fn integer() -> Self {
        Self::of(PropertyType::Primitive(Primitive::Integer))
    }

    pub fn number() -> Self {
        Self::of(PropertyType::Primitive(Primitive::Number))
    }

    pub fn boolean() -> Self {
        Self::of(PropertyType::Primitive(Primitive::Boolean))
    }

    pub fn object() -> Self {
        Self::of(PropertyType::Primitive(Primitive::Object))
    }

    pub fn relation(relation: Relation) -> Self {
        Self::of(PropertyType::Relation(relation))
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    pub fn autonumber(mut self, autonumber: Autonumber) -> Self {
        self.autonumber = Some(autonumber);
        self
    }

    pub fn relation_spec(&self) -> Option<&Relation> {
        match &self.kind {
            PropertyType::Relation(r) => Some(r),
            PropertyType::Primitive(_) => None,
        }
    }

    pub fn primitive(&self) -> Option<Primitive> {
        match &self.kind {
            PropertyType::Primitive(p) => Some(*p),
            PropertyType::Relation(_) => None,
        }
    }

    /// One-to-many composition: children live in the related feather
    pub fn is_to_many(&self) -> bool {
        self.relation_spec().is_some_and(|r| r.parent_of.is_some())
    }

    /// To-one relation stored as a foreign internal key column
    pub fn is_to_one(&self) -> bool {
        self.relation_spec().is_some_and(|r| r.parent_of.is_none())
    }

    /// To-one relation whose target is owned by (and cascades with) this record
    pub fn is_owned(&self) -> bool {
        self.relation_spec()
            .is_some_and(|r| r.parent_of.is_none() && r.is_child)
    }

    pub fn format_is(&self, format: &str) -> bool {
        self.format.as_deref() == Some(format)
    }
}

/// Property type: primitive or relation descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyType {
    Primitive(Primitive),
    Relation(Relation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

/// Relation descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Target feather
    pub relation: String,
    /// Property on the target pointing back here (one-to-many composition)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_of: Option<String>,
    /// Property on the parent holding this record (back-reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_of: Option<String>,
    /// Owned to-one record
    #[serde(default)]
    pub is_child: bool,
    /// Properties of the target rendered alongside its id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

impl Relation {
    pub fn to(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            parent_of: None,
            child_of: None,
            is_child: false,
            properties: Vec::new(),
        }
    }

    pub fn parent_of(mut self, property: impl Into<String>) -> Self {
        self.parent_of = Some(property.into());
        self
    }

    pub fn child_of(mut self, property: impl Into<String>) -> Self {
        self.child_of = Some(property.into());
        self
    }

    pub fn owned(mut self) -> Self {
        self.is_child = true;
        self
    }

    pub fn showing(mut self, properties: &[&str]) -> Self {
        self.properties = properties.iter().map(|p| p.to_string()).collect();
        self
    }
}

/// Sequence-driven generated value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Autonumber {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub length: usize,
    pub sequence: String,
}

impl Autonumber {
    /// Render a sequence value: prefix + zero-padded number + suffix
    pub fn render(&self, value: i64) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            value,
            self.suffix,
            width = self.length
        )
    }
}

/// Lock marker stored on a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub username: String,
    pub created: String,
    pub node_id: String,
    pub session_id: String,
}

/// The root feather with the system fields every record carries
pub fn object_feather() -> Feather {
    Feather::new(OBJECT)
        .property("id", PropertySpec::string().read_only())
        .property("objectType", PropertySpec::string().read_only())
        .property("created", PropertySpec::string().format("dateTime").read_only())
        .property("createdBy", PropertySpec::string().read_only())
        .property("updated", PropertySpec::string().format("dateTime").read_only())
        .property("updatedBy", PropertySpec::string().read_only())
        .property("isDeleted", PropertySpec::boolean().read_only())
        .property("lock", PropertySpec::object().format("lock").read_only())
}

/// Built-in change log feather
pub fn log_feather() -> Feather {
    let mut feather = Feather::new(LOG)
        .plural("Logs")
        .property("objectId", PropertySpec::string().required())
        .property("action", PropertySpec::string().required())
        .property("change", PropertySpec::object());
    feather.is_read_only = true;
    feather
}

/// Properties the engine stamps itself
pub const SYSTEM_PROPERTIES: &[&str] = &[
    "id",
    "objectType",
    "created",
    "createdBy",
    "updated",
    "updatedBy",
    "isDeleted",
    "lock",
];
