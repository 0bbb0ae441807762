//! Raw model types matching the JSON model document (camelCase keys).

use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Primitive and spatial type tags a field may carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Text,
    Integer,
    BigInt,
    Float,
    Decimal,
    Boolean,
    Uuid,
    Date,
    DateTime,
    Json,
    Enum,
    Point,
    Polygon,
    Geometry,
    /// Unrecognised tag; reported by the validator instead of failing deserialization.
    Unknown(String),
}

impl FieldType {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "string" | "varchar" => FieldType::String,
            "text" => FieldType::Text,
            "integer" | "int" | "serial" => FieldType::Integer,
            "bigint" | "bigserial" | "long" => FieldType::BigInt,
            "float" | "double" | "real" => FieldType::Float,
            "decimal" | "numeric" => FieldType::Decimal,
            "boolean" | "bool" => FieldType::Boolean,
            "uuid" => FieldType::Uuid,
            "date" => FieldType::Date,
            "datetime" | "timestamp" | "timestamptz" => FieldType::DateTime,
            "json" | "jsonb" => FieldType::Json,
            "enum" => FieldType::Enum,
            "point" => FieldType::Point,
            "polygon" => FieldType::Polygon,
            "geometry" => FieldType::Geometry,
            _ => FieldType::Unknown(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::BigInt => "bigint",
            FieldType::Float => "float",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Uuid => "uuid",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Json => "json",
            FieldType::Enum => "enum",
            FieldType::Point => "point",
            FieldType::Polygon => "polygon",
            FieldType::Geometry => "geometry",
            FieldType::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self, FieldType::Point | FieldType::Polygon | FieldType::Geometry)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, FieldType::String | FieldType::Text)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::BigInt)
    }

    /// Types usable as a primary key (and therefore as a foreign-key target).
    pub fn is_key_type(&self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Text | FieldType::Integer | FieldType::BigInt | FieldType::Uuid
        )
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = Value::deserialize(deserializer)?;
        match v {
            Value::String(s) => Ok(FieldType::parse(&s)),
            other => Err(serde::de::Error::custom(format!(
                "field type must be a string; got {}",
                type_name_of_json(&other)
            ))),
        }
    }
}

fn type_name_of_json(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDefinition {
    pub entity: String,
    /// Target field; defaults to the target's primary key.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub on_delete: Option<String>,
    #[serde(default)]
    pub on_update: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub array: bool,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub references: Option<ReferenceDefinition>,
    /// Kept as raw JSON so a malformed value is a warning, not a parse failure.
    #[serde(default)]
    pub max_length: Option<Value>,
    #[serde(default)]
    pub min_length: Option<Value>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    /// Named enum reference (see `ModelDocument::enums`).
    #[serde(default, rename = "enum")]
    pub enum_ref: Option<String>,
    /// Inline enum values.
    #[serde(default)]
    pub values: Option<Vec<String>>,
}

impl FieldDefinition {
    pub fn new(name: &str, type_: FieldType) -> Self {
        FieldDefinition {
            name: name.to_string(),
            type_,
            required: false,
            unique: false,
            primary_key: false,
            array: false,
            index: false,
            default: None,
            references: None,
            max_length: None,
            min_length: None,
            pattern: None,
            minimum: None,
            maximum: None,
            enum_ref: None,
            values: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::OneToOne => "oneToOne",
            RelationKind::OneToMany => "oneToMany",
            RelationKind::ManyToOne => "manyToOne",
            RelationKind::ManyToMany => "manyToMany",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDefinition {
    /// Include name; defaults to the target entity (pluralized for to-many kinds).
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub kind: RelationKind,
    pub target: String,
    /// Column override: on the target for oneToMany, on the declaring entity otherwise.
    #[serde(default)]
    pub foreign_key: Option<String>,
    /// Junction identifier for manyToMany.
    #[serde(default)]
    pub through: Option<String>,
    /// Junction column pointing at the declaring entity.
    #[serde(default)]
    pub source_key: Option<String>,
    /// Junction column pointing at the target entity.
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub on_delete: Option<String>,
    /// Extra payload columns on the junction (manyToMany only).
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    /// Adds a created_at column to the junction (manyToMany only).
    #[serde(default)]
    pub timestamps: bool,
}

impl RelationshipDefinition {
    pub fn new(kind: RelationKind, target: &str) -> Self {
        RelationshipDefinition {
            name: None,
            kind,
            target: target.to_string(),
            foreign_key: None,
            through: None,
            source_key: None,
            target_key: None,
            on_delete: None,
            fields: Vec::new(),
            timestamps: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinition {
    #[serde(default)]
    pub name: String,
    /// Table identifier.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub soft_delete: bool,
}

impl EntityDefinition {
    pub fn new(name: &str, table: &str) -> Self {
        EntityDefinition {
            name: name.to_string(),
            table: Some(table.to_string()),
            fields: Vec::new(),
            relationships: Vec::new(),
            indexes: Vec::new(),
            timestamps: false,
            soft_delete: false,
        }
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.primary_key)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnumDefinition {
    pub name: String,
    pub values: Vec<String>,
}

/// All model definitions in one document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelDocument {
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub enums: Vec<EnumDefinition>,
}

impl ModelDocument {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn from_value(v: Value) -> Result<Self, ConfigError> {
        serde_json::from_value(v).map_err(|e| ConfigError::Load(e.to_string()))
    }
}
