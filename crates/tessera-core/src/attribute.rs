use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::tuple::EntityRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "double")]
    Double,
    #[serde(rename = "boolean[]")]
    BooleanArray,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "integer[]")]
    IntegerArray,
    #[serde(rename = "double[]")]
    DoubleArray,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::BooleanArray => "boolean[]",
            Self::StringArray => "string[]",
            Self::IntegerArray => "integer[]",
            Self::DoubleArray => "double[]",
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Self::BooleanArray | Self::StringArray | Self::IntegerArray | Self::DoubleArray
        )
    }

    /// Value used when an entity carries no stored value for a declared attribute.
    pub fn zero_value(&self) -> AttributeValue {
        match self {
            Self::Boolean => AttributeValue::Boolean(false),
            Self::String => AttributeValue::String(String::new()),
            Self::Integer => AttributeValue::Integer(0),
            Self::Double => AttributeValue::Double(0.0),
            Self::BooleanArray => AttributeValue::BooleanArray(Vec::new()),
            Self::StringArray => AttributeValue::StringArray(Vec::new()),
            Self::IntegerArray => AttributeValue::IntegerArray(Vec::new()),
            Self::DoubleArray => AttributeValue::DoubleArray(Vec::new()),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeType {
    type Err = AttributeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "boolean" => Ok(Self::Boolean),
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "double" => Ok(Self::Double),
            "boolean[]" => Ok(Self::BooleanArray),
            "string[]" => Ok(Self::StringArray),
            "integer[]" => Ok(Self::IntegerArray),
            "double[]" => Ok(Self::DoubleArray),
            other => Err(AttributeParseError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AttributeValue {
    #[serde(rename = "boolean")]
    Boolean(bool),
    #[serde(rename = "string")]
    String(String),
    #[serde(rename = "integer")]
    Integer(i64),
    #[serde(rename = "double")]
    Double(f64),
    #[serde(rename = "boolean[]")]
    BooleanArray(Vec<bool>),
    #[serde(rename = "string[]")]
    StringArray(Vec<String>),
    #[serde(rename = "integer[]")]
    IntegerArray(Vec<i64>),
    #[serde(rename = "double[]")]
    DoubleArray(Vec<f64>),
}

impl AttributeValue {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Self::Boolean(_) => AttributeType::Boolean,
            Self::String(_) => AttributeType::String,
            Self::Integer(_) => AttributeType::Integer,
            Self::Double(_) => AttributeType::Double,
            Self::BooleanArray(_) => AttributeType::BooleanArray,
            Self::StringArray(_) => AttributeType::StringArray,
            Self::IntegerArray(_) => AttributeType::IntegerArray,
            Self::DoubleArray(_) => AttributeType::DoubleArray,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// JSON form consumed by rule expressions.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean(b) => Value::from(*b),
            Self::String(s) => Value::from(s.as_str()),
            Self::Integer(i) => Value::from(*i),
            Self::Double(d) => Value::from(*d),
            Self::BooleanArray(v) => Value::from(v.clone()),
            Self::StringArray(v) => Value::from(v.clone()),
            Self::IntegerArray(v) => Value::from(v.clone()),
            Self::DoubleArray(v) => Value::from(v.clone()),
        }
    }

    /// Parses the textual value part of `type:value`.
    pub fn parse_typed(attribute_type: AttributeType, raw: &str) -> Result<Self, AttributeParseError> {
        let invalid = || AttributeParseError::Value {
            attribute_type,
            value: raw.to_string(),
        };
        let items = || -> Vec<&str> {
            if raw.trim().is_empty() {
                Vec::new()
            } else {
                raw.split(',').map(str::trim).collect()
            }
        };
        let value = match attribute_type {
            AttributeType::Boolean => Self::Boolean(raw.trim().parse().map_err(|_| invalid())?),
            AttributeType::String => Self::String(raw.to_string()),
            AttributeType::Integer => Self::Integer(raw.trim().parse().map_err(|_| invalid())?),
            AttributeType::Double => Self::Double(raw.trim().parse().map_err(|_| invalid())?),
            AttributeType::BooleanArray => Self::BooleanArray(
                items()
                    .into_iter()
                    .map(|s| s.parse().map_err(|_| invalid()))
                    .collect::<Result<_, _>>()?,
            ),
            AttributeType::StringArray => {
                Self::StringArray(items().into_iter().map(str::to_string).collect())
            }
            AttributeType::IntegerArray => Self::IntegerArray(
                items()
                    .into_iter()
                    .map(|s| s.parse().map_err(|_| invalid()))
                    .collect::<Result<_, _>>()?,
            ),
            AttributeType::DoubleArray => Self::DoubleArray(
                items()
                    .into_iter()
                    .map(|s| s.parse().map_err(|_| invalid()))
                    .collect::<Result<_, _>>()?,
            ),
        };
        Ok(value)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: ToString>(items: &[T]) -> String {
            items.iter().map(T::to_string).collect::<Vec<_>>().join(",")
        }
        let ty = self.attribute_type();
        match self {
            Self::Boolean(b) => write!(f, "{ty}:{b}"),
            Self::String(s) => write!(f, "{ty}:{s}"),
            Self::Integer(i) => write!(f, "{ty}:{i}"),
            Self::Double(d) => write!(f, "{ty}:{d}"),
            Self::BooleanArray(v) => write!(f, "{ty}:{}", join(v)),
            Self::StringArray(v) => write!(f, "{ty}:{}", join(v)),
            Self::IntegerArray(v) => write!(f, "{ty}:{}", join(v)),
            Self::DoubleArray(v) => write!(f, "{ty}:{}", join(v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttributeParseError {
    #[error("invalid attribute '{0}': expected entity:id$attribute|type:value")]
    Format(String),
    #[error("unknown attribute type '{0}'")]
    UnknownType(String),
    #[error("value '{value}' is not a valid {attribute_type}")]
    Value {
        attribute_type: AttributeType,
        value: String,
    },
}

impl AttributeParseError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidAttribute
    }
}

/// A typed fact about one entity: `entity$attribute|type:value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub entity: EntityRef,
    pub attribute: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(entity: EntityRef, attribute: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            entity,
            attribute: attribute.into(),
            value,
        }
    }

    pub fn key(&self) -> (&EntityRef, &str) {
        (&self.entity, &self.attribute)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}|{}", self.entity, self.attribute, self.value)
    }
}

impl FromStr for Attribute {
    type Err = AttributeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = || AttributeParseError::Format(s.to_string());
        let (entity, rest) = s.trim().split_once('$').ok_or_else(format)?;
        let (attribute, typed) = rest.split_once('|').ok_or_else(format)?;
        let (ty, raw) = typed.split_once(':').ok_or_else(format)?;
        if attribute.is_empty() {
            return Err(format());
        }
        let entity: EntityRef = entity.parse().map_err(|_| format())?;
        let attribute_type: AttributeType = ty.parse()?;
        let value = AttributeValue::parse_typed(attribute_type, raw)?;
        Ok(Self::new(entity, attribute, value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub attribute: Option<String>,
}

impl AttributeFilter {
    pub fn exact(entity: &EntityRef, attribute: &str) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            attribute: Some(attribute.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_type.is_none() && self.entity_id.is_none() && self.attribute.is_none()
    }

    pub fn matches(&self, attr: &Attribute) -> bool {
        if let Some(ref et) = self.entity_type
            && et != &attr.entity.entity_type
        {
            return false;
        }
        if let Some(ref ei) = self.entity_id
            && ei != &attr.entity.entity_id
        {
            return false;
        }
        if let Some(ref a) = self.attribute
            && a != &attr.attribute
        {
            return false;
        }
        true
    }
}
