//! Struct Records
//!
//! A struct record is one row of positionally indexed, possibly empty,
//! typed slots produced or consumed by the wire codec. The gateway only
//! touches record contents through [`StructRecord`], so codecs backed by
//! foreign buffers and the in-memory [`MemoryRecord`] are interchangeable.
//!
//! Records are owned values. Whoever holds the `Box<dyn StructRecord>`
//! releases it by dropping it, which happens exactly once on every path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::schema::FieldType;

/// Header fields shared by every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Namespace id of the record's shape.
    pub namespace: u32,
    /// Shape id.
    pub meta_id: u32,
    /// Market code.
    pub market: String,
    /// Instrument code.
    pub code: String,
    /// Time tag of the row.
    pub time_tag: u64,
    /// Bar granularity (0 for snapshots).
    pub granularity: u32,
}

/// Typed value of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 32-bit integer.
    Int32(i32),
    /// Float.
    Double(f64),
    /// String.
    String(String),
    /// 64-bit integer.
    Int64(i64),
    /// Integer vector.
    Int32Vector(Vec<i32>),
    /// Float vector.
    DoubleVector(Vec<f64>),
    /// String vector.
    StringVector(Vec<String>),
    /// 64-bit integer vector.
    Int64Vector(Vec<i64>),
}

impl FieldValue {
    /// The shape of this value.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Int32(_) => FieldType::Int32,
            Self::Double(_) => FieldType::Double,
            Self::String(_) => FieldType::String,
            Self::Int64(_) => FieldType::Int64,
            Self::Int32Vector(_) => FieldType::Int32Vector,
            Self::DoubleVector(_) => FieldType::DoubleVector,
            Self::StringVector(_) => FieldType::StringVector,
            Self::Int64Vector(_) => FieldType::Int64Vector,
        }
    }

    /// Number of elements (1 for scalars).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int32Vector(v) => v.len(),
            Self::DoubleVector(v) => v.len(),
            Self::StringVector(v) => v.len(),
            Self::Int64Vector(v) => v.len(),
            _ => 1,
        }
    }

    /// Whether a vector value has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar at `index` of a vector value; scalars return themselves.
    #[must_use]
    pub fn element(&self, index: usize) -> Option<Self> {
        match self {
            Self::Int32Vector(v) => v.get(index).copied().map(Self::Int32),
            Self::DoubleVector(v) => v.get(index).copied().map(Self::Double),
            Self::StringVector(v) => v.get(index).cloned().map(Self::String),
            Self::Int64Vector(v) => v.get(index).copied().map(Self::Int64),
            scalar => Some(scalar.clone()),
        }
    }
}

/// Slot access failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Index beyond the record's field count.
    #[error("field index {index} out of range (field count {count})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Record field count.
        count: usize,
    },

    /// Slot holds a different type than requested.
    #[error("field {index} is not {expected}")]
    TypeMismatch {
        /// Requested index.
        index: usize,
        /// Requested type.
        expected: FieldType,
    },

    /// Slot is empty.
    #[error("field {0} is empty")]
    Empty(usize),
}

/// Typed access to one codec-backed row.
pub trait StructRecord: Send + Sync + fmt::Debug {
    /// Record header.
    fn header(&self) -> &RecordHeader;

    /// Mutable record header.
    fn header_mut(&mut self) -> &mut RecordHeader;

    /// Number of slots.
    fn field_count(&self) -> usize;

    /// Whether slot `index` carries no value.
    fn is_field_empty(&self, index: usize) -> bool;

    /// Read an `Int32` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_int32(&self, index: usize) -> Result<i32, RecordError>;

    /// Read a `Double` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_double(&self, index: usize) -> Result<f64, RecordError>;

    /// Read a `String` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_string(&self, index: usize) -> Result<String, RecordError>;

    /// Read an `Int64` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_int64(&self, index: usize) -> Result<i64, RecordError>;

    /// Read an `Int32Vector` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_int32_vector(&self, index: usize) -> Result<Vec<i32>, RecordError>;

    /// Read a `DoubleVector` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_double_vector(&self, index: usize) -> Result<Vec<f64>, RecordError>;

    /// Read a `StringVector` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_string_vector(&self, index: usize) -> Result<Vec<String>, RecordError>;

    /// Read an `Int64Vector` slot.
    ///
    /// # Errors
    ///
    /// Fails on a bad index, an empty slot, or a type mismatch.
    fn get_int64_vector(&self, index: usize) -> Result<Vec<i64>, RecordError>;

    /// Write an `Int32` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_int32(&mut self, index: usize, value: i32) -> Result<(), RecordError>;

    /// Write a `Double` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_double(&mut self, index: usize, value: f64) -> Result<(), RecordError>;

    /// Write a `String` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_string(&mut self, index: usize, value: String) -> Result<(), RecordError>;

    /// Write an `Int64` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_int64(&mut self, index: usize, value: i64) -> Result<(), RecordError>;

    /// Write an `Int32Vector` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_int32_vector(&mut self, index: usize, value: Vec<i32>) -> Result<(), RecordError>;

    /// Write a `DoubleVector` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_double_vector(&mut self, index: usize, value: Vec<f64>) -> Result<(), RecordError>;

    /// Write a `StringVector` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_string_vector(&mut self, index: usize, value: Vec<String>) -> Result<(), RecordError>;

    /// Write an `Int64Vector` slot.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    fn set_int64_vector(&mut self, index: usize, value: Vec<i64>) -> Result<(), RecordError>;
}

/// Source of fresh records sized for a descriptor.
pub trait RecordAllocator {
    /// Allocate an empty record with `field_count` slots.
    fn allocate(&self, header: RecordHeader, field_count: usize) -> Box<dyn StructRecord>;
}

/// Allocates [`MemoryRecord`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryAllocator;

impl RecordAllocator for MemoryAllocator {
    fn allocate(&self, header: RecordHeader, field_count: usize) -> Box<dyn StructRecord> {
        Box::new(MemoryRecord::new(header, field_count))
    }
}

// =============================================================================
// In-memory record
// =============================================================================

/// Heap-backed record used by the reference codec and in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    header: RecordHeader,
    slots: Vec<Option<FieldValue>>,
}

impl MemoryRecord {
    /// Record with `field_count` empty slots.
    #[must_use]
    pub fn new(header: RecordHeader, field_count: usize) -> Self {
        Self {
            header,
            slots: vec![None; field_count],
        }
    }

    /// Record from prebuilt slots.
    #[must_use]
    pub const fn from_slots(header: RecordHeader, slots: Vec<Option<FieldValue>>) -> Self {
        Self { header, slots }
    }

    /// Slot values.
    #[must_use]
    pub fn slots(&self) -> &[Option<FieldValue>] {
        &self.slots
    }

    fn slot(&self, index: usize) -> Result<&FieldValue, RecordError> {
        self.slots
            .get(index)
            .ok_or(RecordError::IndexOutOfRange {
                index,
                count: self.slots.len(),
            })?
            .as_ref()
            .ok_or(RecordError::Empty(index))
    }

    fn put(&mut self, index: usize, value: FieldValue) -> Result<(), RecordError> {
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(RecordError::IndexOutOfRange { index, count })?;
        *slot = Some(value);
        Ok(())
    }

    const fn mismatch(index: usize, expected: FieldType) -> RecordError {
        RecordError::TypeMismatch { index, expected }
    }
}

impl StructRecord for MemoryRecord {
    fn header(&self) -> &RecordHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RecordHeader {
        &mut self.header
    }

    fn field_count(&self) -> usize {
        self.slots.len()
    }

    fn is_field_empty(&self, index: usize) -> bool {
        self.slots.get(index).is_none_or(Option::is_none)
    }

    fn get_int32(&self, index: usize) -> Result<i32, RecordError> {
        match self.slot(index)? {
            FieldValue::Int32(v) => Ok(*v),
            _ => Err(Self::mismatch(index, FieldType::Int32)),
        }
    }

    fn get_double(&self, index: usize) -> Result<f64, RecordError> {
        match self.slot(index)? {
            FieldValue::Double(v) => Ok(*v),
            _ => Err(Self::mismatch(index, FieldType::Double)),
        }
    }

    fn get_string(&self, index: usize) -> Result<String, RecordError> {
        match self.slot(index)? {
            FieldValue::String(v) => Ok(v.clone()),
            _ => Err(Self::mismatch(index, FieldType::String)),
        }
    }

    fn get_int64(&self, index: usize) -> Result<i64, RecordError> {
        match self.slot(index)? {
            FieldValue::Int64(v) => Ok(*v),
            _ => Err(Self::mismatch(index, FieldType::Int64)),
        }
    }

    fn get_int32_vector(&self, index: usize) -> Result<Vec<i32>, RecordError> {
        match self.slot(index)? {
            FieldValue::Int32Vector(v) => Ok(v.clone()),
            _ => Err(Self::mismatch(index, FieldType::Int32Vector)),
        }
    }

    fn get_double_vector(&self, index: usize) -> Result<Vec<f64>, RecordError> {
        match self.slot(index)? {
            FieldValue::DoubleVector(v) => Ok(v.clone()),
            _ => Err(Self::mismatch(index, FieldType::DoubleVector)),
        }
    }

    fn get_string_vector(&self, index: usize) -> Result<Vec<String>, RecordError> {
        match self.slot(index)? {
            FieldValue::StringVector(v) => Ok(v.clone()),
            _ => Err(Self::mismatch(index, FieldType::StringVector)),
        }
    }

    fn get_int64_vector(&self, index: usize) -> Result<Vec<i64>, RecordError> {
        match self.slot(index)? {
            FieldValue::Int64Vector(v) => Ok(v.clone()),
            _ => Err(Self::mismatch(index, FieldType::Int64Vector)),
        }
    }

    fn set_int32(&mut self, index: usize, value: i32) -> Result<(), RecordError> {
        self.put(index, FieldValue::Int32(value))
    }

    fn set_double(&mut self, index: usize, value: f64) -> Result<(), RecordError> {
        self.put(index, FieldValue::Double(value))
    }

    fn set_string(&mut self, index: usize, value: String) -> Result<(), RecordError> {
        self.put(index, FieldValue::String(value))
    }

    fn set_int64(&mut self, index: usize, value: i64) -> Result<(), RecordError> {
        self.put(index, FieldValue::Int64(value))
    }

    fn set_int32_vector(&mut self, index: usize, value: Vec<i32>) -> Result<(), RecordError> {
        self.put(index, FieldValue::Int32Vector(value))
    }

    fn set_double_vector(&mut self, index: usize, value: Vec<f64>) -> Result<(), RecordError> {
        self.put(index, FieldValue::DoubleVector(value))
    }

    fn set_string_vector(&mut self, index: usize, value: Vec<String>) -> Result<(), RecordError> {
        self.put(index, FieldValue::StringVector(value))
    }

    fn set_int64_vector(&mut self, index: usize, value: Vec<i64>) -> Result<(), RecordError> {
        self.put(index, FieldValue::Int64Vector(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_empty_slots() {
        let record = MemoryRecord::new(RecordHeader::default(), 3);
        assert_eq!(record.field_count(), 3);
        assert!((0..3).all(|i| record.is_field_empty(i)));
        assert!(record.is_field_empty(99));
    }

    #[test]
    fn typed_get_checks_type() {
        let mut record = MemoryRecord::new(RecordHeader::default(), 2);
        record.set_int32(0, 42).unwrap();
        assert_eq!(record.get_int32(0).unwrap(), 42);
        assert_eq!(
            record.get_double(0),
            Err(RecordError::TypeMismatch {
                index: 0,
                expected: FieldType::Double
            })
        );
        assert_eq!(record.get_int32(1), Err(RecordError::Empty(1)));
    }

    #[test]
    fn set_out_of_range_fails() {
        let mut record = MemoryRecord::new(RecordHeader::default(), 1);
        assert_eq!(
            record.set_string(1, "x".to_string()),
            Err(RecordError::IndexOutOfRange { index: 1, count: 1 })
        );
    }

    #[test]
    fn element_extracts_from_vectors() {
        let value = FieldValue::StringVector(vec!["a".into(), "b".into()]);
        assert_eq!(value.len(), 2);
        assert_eq!(value.element(1), Some(FieldValue::String("b".into())));
        assert_eq!(value.element(2), None);
        assert_eq!(FieldValue::Int32(5).element(9), Some(FieldValue::Int32(5)));
    }
}
