//! Struct Value Mapping
//!
//! Converts between codec records and named-attribute objects using the
//! ordered field list of one bound [`MetaDescriptor`]. Every conversion
//! dispatches on [`FieldType`], so adding a type is a compile error until
//! each direction handles it.
//!
//! Three representations are involved:
//!
//! - [`StructRecord`]: positional, typed, codec-owned
//! - [`MappedObject`]: named attributes mirroring the descriptor
//! - [`PlainObject`]: JSON-friendly projection, 64-bit integers as strings

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::record::{
    FieldValue, RecordAllocator, RecordError, RecordHeader, StructRecord,
};
use crate::domain::schema::{FieldDescriptor, FieldType, MetaDescriptor};

/// Conversion failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MapError {
    /// The record refused a typed access.
    #[error("field '{field}': {source}")]
    Record {
        /// Field name.
        field: String,
        /// Underlying slot error.
        source: RecordError,
    },

    /// The descriptor has no field with this name.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// Value does not match the declared field type.
    #[error("field '{field}' expects {expected}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Declared type.
        expected: FieldType,
    },
}

// =============================================================================
// Mapper
// =============================================================================

/// Converter bound to one descriptor revision.
#[derive(Debug, Clone)]
pub struct StructValueMapper {
    descriptor: Arc<MetaDescriptor>,
}

impl StructValueMapper {
    /// Bind to `descriptor`; its field order drives every conversion.
    #[must_use]
    pub const fn bind(descriptor: Arc<MetaDescriptor>) -> Self {
        Self { descriptor }
    }

    /// Bound descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &Arc<MetaDescriptor> {
        &self.descriptor
    }

    /// Read a record into a new object.
    ///
    /// Slots past the record's own field count stay null.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Record`] if a non-empty slot disagrees with the
    /// descriptor's type.
    pub fn from_record(&self, record: &dyn StructRecord) -> Result<MappedObject, MapError> {
        let header = record.header();
        let mut object = MappedObject::empty(Arc::clone(&self.descriptor));
        object.market.clone_from(&header.market);
        object.code.clone_from(&header.code);
        object.time_tag = header.time_tag;
        object.granularity = header.granularity;

        let readable = self.descriptor.fields.len().min(record.field_count());
        for (index, field) in self.descriptor.fields.iter().take(readable).enumerate() {
            if record.is_field_empty(index) {
                continue;
            }
            let value = read_slot(record, index, field).map_err(|source| MapError::Record {
                field: field.name.clone(),
                source,
            })?;
            object.values[index] = Some(value);
        }
        Ok(object)
    }

    /// Rebuild an object from its plain projection.
    ///
    /// Fields absent from `plain.fields` stay null; unknown names are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::TypeMismatch`] if a value cannot be read as the
    /// declared type.
    pub fn from_plain(&self, plain: &PlainObject) -> Result<MappedObject, MapError> {
        let mut object = MappedObject::empty(Arc::clone(&self.descriptor));
        object.market.clone_from(&plain.market);
        object.code.clone_from(&plain.code);
        object.time_tag = plain.time_tag;
        object.granularity = plain.granularity;

        for (index, field) in self.descriptor.fields.iter().enumerate() {
            if let Some(json) = plain.fields.get(&field.name) {
                object.values[index] = json_to_value(json, field)?;
            }
        }
        Ok(object)
    }
}

fn read_slot(
    record: &dyn StructRecord,
    index: usize,
    field: &FieldDescriptor,
) -> Result<FieldValue, RecordError> {
    Ok(match field.field_type {
        FieldType::Int32 => FieldValue::Int32(record.get_int32(index)?),
        FieldType::Double => FieldValue::Double(record.get_double(index)?),
        FieldType::String => FieldValue::String(record.get_string(index)?),
        FieldType::Int64 => FieldValue::Int64(record.get_int64(index)?),
        FieldType::Int32Vector => FieldValue::Int32Vector(record.get_int32_vector(index)?),
        FieldType::DoubleVector => FieldValue::DoubleVector(record.get_double_vector(index)?),
        FieldType::StringVector => FieldValue::StringVector(record.get_string_vector(index)?),
        FieldType::Int64Vector => FieldValue::Int64Vector(record.get_int64_vector(index)?),
    })
}

fn write_slot(
    record: &mut dyn StructRecord,
    index: usize,
    value: &FieldValue,
) -> Result<(), RecordError> {
    match value {
        FieldValue::Int32(v) => record.set_int32(index, *v),
        FieldValue::Double(v) => record.set_double(index, *v),
        FieldValue::String(v) => record.set_string(index, v.clone()),
        FieldValue::Int64(v) => record.set_int64(index, *v),
        FieldValue::Int32Vector(v) => record.set_int32_vector(index, v.clone()),
        FieldValue::DoubleVector(v) => record.set_double_vector(index, v.clone()),
        FieldValue::StringVector(v) => record.set_string_vector(index, v.clone()),
        FieldValue::Int64Vector(v) => record.set_int64_vector(index, v.clone()),
    }
}

// =============================================================================
// Mapped Object
// =============================================================================

/// Named attributes of one row, shaped by its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedObject {
    descriptor: Arc<MetaDescriptor>,
    /// Market code.
    pub market: String,
    /// Instrument code.
    pub code: String,
    /// Row time tag.
    pub time_tag: u64,
    /// Bar granularity.
    pub granularity: u32,
    values: Vec<Option<FieldValue>>,
}

impl MappedObject {
    /// Object with every attribute null.
    #[must_use]
    pub fn empty(descriptor: Arc<MetaDescriptor>) -> Self {
        let values = vec![None; descriptor.fields.len()];
        Self {
            descriptor,
            market: String::new(),
            code: String::new(),
            time_tag: 0,
            granularity: 0,
            values,
        }
    }

    /// Descriptor this object follows.
    #[must_use]
    pub const fn descriptor(&self) -> &Arc<MetaDescriptor> {
        &self.descriptor
    }

    /// Attribute value, `None` when null or unknown.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        let index = self.descriptor.field_index(name)?;
        self.values.get(index)?.as_ref()
    }

    /// Set or clear an attribute.
    ///
    /// # Errors
    ///
    /// Fails on an unknown name or a value of the wrong type.
    pub fn set(&mut self, name: &str, value: Option<FieldValue>) -> Result<(), MapError> {
        let index = self
            .descriptor
            .field_index(name)
            .ok_or_else(|| MapError::UnknownField(name.to_string()))?;
        let expected = self.descriptor.fields[index].field_type;
        if let Some(v) = &value
            && v.field_type() != expected
        {
            return Err(MapError::TypeMismatch {
                field: name.to_string(),
                expected,
            });
        }
        self.values[index] = value;
        Ok(())
    }

    /// `(field, value)` pairs in descriptor order.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldDescriptor, Option<&FieldValue>)> {
        self.descriptor
            .fields
            .iter()
            .zip(self.values.iter().map(Option::as_ref))
    }

    /// Write this object into a freshly allocated record.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Record`] if the allocator produced a record the
    /// values do not fit.
    pub fn to_record(
        &self,
        allocator: &dyn RecordAllocator,
    ) -> Result<Box<dyn StructRecord>, MapError> {
        let header = RecordHeader {
            namespace: self.descriptor.namespace,
            meta_id: self.descriptor.meta_id,
            market: self.market.clone(),
            code: self.code.clone(),
            time_tag: self.time_tag,
            granularity: self.granularity,
        };
        let mut record = allocator.allocate(header, self.descriptor.fields.len());
        for (index, (field, value)) in self.iter().enumerate() {
            if let Some(value) = value {
                write_slot(record.as_mut(), index, value).map_err(|source| MapError::Record {
                    field: field.name.clone(),
                    source,
                })?;
            }
        }
        Ok(record)
    }

    /// JSON-friendly projection.
    #[must_use]
    pub fn to_plain(&self) -> PlainObject {
        let fields = self
            .iter()
            .map(|(field, value)| (field.name.clone(), value.map_or(Value::Null, value_to_json)))
            .collect();
        PlainObject {
            namespace: self.descriptor.namespace,
            meta_id: self.descriptor.meta_id,
            meta_name: self.descriptor.qualified_name.clone(),
            market: self.market.clone(),
            code: self.code.clone(),
            time_tag: self.time_tag,
            granularity: self.granularity,
            fields,
        }
    }
}

// =============================================================================
// Plain Projection
// =============================================================================

/// Transport-friendly row: header plus `name -> JSON value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainObject {
    /// Namespace id.
    pub namespace: u32,
    /// Shape id.
    pub meta_id: u32,
    /// Qualified shape name.
    pub meta_name: String,
    /// Market code.
    pub market: String,
    /// Instrument code.
    pub code: String,
    /// Row time tag.
    #[serde(rename = "timetag")]
    pub time_tag: u64,
    /// Bar granularity.
    pub granularity: u32,
    /// Attribute values; null when the slot was empty.
    pub fields: BTreeMap<String, Value>,
}

impl PlainObject {
    /// Keep only the named fields.
    pub fn retain_fields(&mut self, names: &[String]) {
        self.fields.retain(|name, _| names.iter().any(|n| n == name));
    }
}

fn value_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Int32(v) => Value::from(*v),
        FieldValue::Double(v) => Value::from(*v),
        FieldValue::String(v) => Value::from(v.as_str()),
        FieldValue::Int64(v) => Value::from(v.to_string()),
        FieldValue::Int32Vector(v) => Value::from(v.clone()),
        FieldValue::DoubleVector(v) => Value::from(v.clone()),
        FieldValue::StringVector(v) => Value::from(v.clone()),
        FieldValue::Int64Vector(v) => v.iter().map(|x| Value::from(x.to_string())).collect(),
    }
}

fn json_to_value(json: &Value, field: &FieldDescriptor) -> Result<Option<FieldValue>, MapError> {
    if json.is_null() {
        return Ok(None);
    }
    let mismatch = || MapError::TypeMismatch {
        field: field.name.clone(),
        expected: field.field_type,
    };
    let value = match field.field_type {
        FieldType::Int32 => FieldValue::Int32(json_i32(json).ok_or_else(mismatch)?),
        FieldType::Double => FieldValue::Double(json.as_f64().ok_or_else(mismatch)?),
        FieldType::String => FieldValue::String(json.as_str().ok_or_else(mismatch)?.to_string()),
        FieldType::Int64 => FieldValue::Int64(json_i64(json).ok_or_else(mismatch)?),
        FieldType::Int32Vector => {
            FieldValue::Int32Vector(json_array(json, json_i32).ok_or_else(mismatch)?)
        }
        FieldType::DoubleVector => {
            FieldValue::DoubleVector(json_array(json, Value::as_f64).ok_or_else(mismatch)?)
        }
        FieldType::StringVector => FieldValue::StringVector(
            json_array(json, |v| v.as_str().map(str::to_string)).ok_or_else(mismatch)?,
        ),
        FieldType::Int64Vector => {
            FieldValue::Int64Vector(json_array(json, json_i64).ok_or_else(mismatch)?)
        }
    };
    Ok(Some(value))
}

fn json_i32(json: &Value) -> Option<i32> {
    json.as_i64().and_then(|v| i32::try_from(v).ok())
}

// Decimal strings are canonical; bare numbers are accepted too.
fn json_i64(json: &Value) -> Option<i64> {
    match json {
        Value::String(s) => s.parse().ok(),
        other => other.as_i64(),
    }
}

fn json_array<T>(json: &Value, element: impl Fn(&Value) -> Option<T>) -> Option<Vec<T>> {
    json.as_array()?.iter().map(element).collect()
}
