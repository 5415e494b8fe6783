//! Schema Registry
//!
//! Holds the metadata descriptors decoded from an upstream schema frame and
//! resolves `(namespace, qualified name, revision ceiling)` lookups against
//! them. A registry is built wholesale from one schema frame; a new frame
//! produces a new registry rather than patching the old one.
//!
//! # Example
//!
//! ```rust
//! use market_gateway::domain::schema::{FieldDescriptor, FieldType, MetaDescriptor, SchemaRegistry};
//!
//! let quote = |revision| {
//!     MetaDescriptor::new(
//!         0,
//!         10 + revision,
//!         "global::SampleQuote",
//!         revision,
//!         vec![FieldDescriptor::new("close", FieldType::Double, 0)],
//!     )
//! };
//! let registry = SchemaRegistry::load([quote(0), quote(2), quote(5)]);
//!
//! assert_eq!(registry.resolve(0, "SampleQuote", 3).unwrap().revision, 2);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Namespace id of server-wide shapes.
pub const NAMESPACE_GLOBAL: u32 = 0;

/// Namespace id of account-private shapes.
pub const NAMESPACE_PRIVATE: u32 = 1;

/// Upper bound on fields taken from a single descriptor.
pub const MAX_FIELDS_PER_DESCRIPTOR: usize = 100;

/// Ceiling that admits every revision.
pub const LATEST_REVISION: u32 = u32::MAX;

/// Textual prefix of a namespace id.
#[must_use]
pub const fn namespace_prefix(namespace: u32) -> &'static str {
    match namespace {
        NAMESPACE_GLOBAL => "global",
        NAMESPACE_PRIVATE => "private",
        _ => "unknown",
    }
}

/// Strip a `<namespace>::` prefix from a qualified name.
#[must_use]
pub fn local_name(qualified_name: &str) -> &str {
    qualified_name
        .rsplit_once("::")
        .map_or(qualified_name, |(_, name)| name)
}

// =============================================================================
// Field Types
// =============================================================================

/// Closed set of value shapes a record slot can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 32-bit signed integer.
    Int32,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// 64-bit signed integer, projected as a decimal string.
    Int64,
    /// Vector of 32-bit integers.
    Int32Vector,
    /// Vector of floats.
    DoubleVector,
    /// Vector of strings.
    StringVector,
    /// Vector of 64-bit integers, projected as decimal strings.
    Int64Vector,
}

impl FieldType {
    /// Whether the type holds a vector of elements.
    #[must_use]
    pub const fn is_vector(self) -> bool {
        matches!(
            self,
            Self::Int32Vector | Self::DoubleVector | Self::StringVector | Self::Int64Vector
        )
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Double => "double",
            Self::String => "string",
            Self::Int64 => "int64",
            Self::Int32Vector => "int32_vector",
            Self::DoubleVector => "double_vector",
            Self::StringVector => "string_vector",
            Self::Int64Vector => "int64_vector",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// One positional field of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Attribute name.
    pub name: String,
    /// Value shape.
    pub field_type: FieldType,
    /// Slot index in the record.
    pub position: usize,
    /// Display precision for floating values.
    pub precision: u8,
    /// Whether the field carries more than one value per record.
    pub is_multivalued: bool,
    placeholder: bool,
}

impl FieldDescriptor {
    /// Create a field. An empty name is replaced by a positional placeholder.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType, position: usize) -> Self {
        let name = name.into();
        let placeholder = name.trim().is_empty();
        let name = if placeholder {
            format!("_{position}")
        } else {
            name
        };
        Self {
            name,
            field_type,
            position,
            precision: 0,
            is_multivalued: field_type.is_vector(),
            placeholder,
        }
    }

    /// Set the display precision.
    #[must_use]
    pub const fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    /// Whether the name was synthesized from the position.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

/// Immutable description of one record shape at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaDescriptor {
    /// Namespace id.
    pub namespace: u32,
    /// Shape id, unique within the namespace.
    pub meta_id: u32,
    /// `<namespace>::<TypeName>`.
    pub qualified_name: String,
    /// Shape revision.
    pub revision: u32,
    /// Fields in slot order.
    pub fields: Vec<FieldDescriptor>,
}

impl MetaDescriptor {
    /// Create a descriptor, keeping at most [`MAX_FIELDS_PER_DESCRIPTOR`] fields.
    #[must_use]
    pub fn new(
        namespace: u32,
        meta_id: u32,
        qualified_name: impl Into<String>,
        revision: u32,
        mut fields: Vec<FieldDescriptor>,
    ) -> Self {
        let qualified_name = qualified_name.into();
        if fields.len() > MAX_FIELDS_PER_DESCRIPTOR {
            tracing::warn!(
                qualified_name = %qualified_name,
                fields = fields.len(),
                cap = MAX_FIELDS_PER_DESCRIPTOR,
                "Descriptor field list truncated"
            );
            fields.truncate(MAX_FIELDS_PER_DESCRIPTOR);
        }
        Self {
            namespace,
            meta_id,
            qualified_name,
            revision,
            fields,
        }
    }

    /// Qualified name without the namespace prefix.
    #[must_use]
    pub fn local_name(&self) -> &str {
        local_name(&self.qualified_name)
    }

    /// Slot index of a named field.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// A shape made only of parallel vectors, one element per instrument.
    #[must_use]
    pub fn is_security_list(&self) -> bool {
        !self.fields.is_empty() && self.fields.iter().all(|f| f.field_type.is_vector())
    }

    /// Whether `name` refers to this shape, with or without namespace prefix.
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        self.qualified_name == name || self.local_name() == local_name(name)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Schema lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// No descriptor with the name at or below the ceiling.
    #[error("no descriptor for {namespace}::{name} at revision <= {ceiling}")]
    ResolutionFailure {
        /// Namespace searched.
        namespace: u32,
        /// Local name searched.
        name: String,
        /// Revision ceiling.
        ceiling: u32,
    },

    /// No descriptor registered under the id pair.
    #[error("unknown meta id {meta_id} in namespace {namespace}")]
    UnknownMetaId {
        /// Namespace id.
        namespace: u32,
        /// Shape id.
        meta_id: u32,
    },
}

/// Descriptors of one schema frame, indexed by `(namespace, meta_id)`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    descriptors: HashMap<(u32, u32), Arc<MetaDescriptor>>,
}

impl SchemaRegistry {
    /// Build a registry from decoded descriptors.
    ///
    /// A repeated `(namespace, meta_id)` pair keeps the later descriptor.
    pub fn load(descriptors: impl IntoIterator<Item = MetaDescriptor>) -> Self {
        let mut index = HashMap::new();
        for descriptor in descriptors {
            let key = (descriptor.namespace, descriptor.meta_id);
            if let Some(previous) = index.insert(key, Arc::new(descriptor)) {
                tracing::warn!(
                    namespace = key.0,
                    meta_id = key.1,
                    replaced = %previous.qualified_name,
                    "Duplicate descriptor id in schema frame"
                );
            }
        }
        Self { descriptors: index }
    }

    /// Number of descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no descriptors are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptor by id pair.
    #[must_use]
    pub fn get(&self, namespace: u32, meta_id: u32) -> Option<Arc<MetaDescriptor>> {
        self.descriptors.get(&(namespace, meta_id)).cloned()
    }

    /// Iterate over every descriptor.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MetaDescriptor>> {
        self.descriptors.values()
    }

    /// Highest revision `<= ceiling` of the named shape in `namespace`.
    ///
    /// Equal revisions are broken by the lowest `meta_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ResolutionFailure`] if nothing qualifies.
    pub fn resolve(
        &self,
        namespace: u32,
        qualified_name: &str,
        ceiling: u32,
    ) -> Result<Arc<MetaDescriptor>, SchemaError> {
        let name = local_name(qualified_name);
        self.descriptors
            .values()
            .filter(|d| d.namespace == namespace && d.local_name() == name)
            .filter(|d| d.revision <= ceiling)
            .max_by(|a, b| {
                a.revision
                    .cmp(&b.revision)
                    .then_with(|| b.meta_id.cmp(&a.meta_id))
            })
            .cloned()
            .ok_or_else(|| SchemaError::ResolutionFailure {
                namespace,
                name: name.to_string(),
                ceiling,
            })
    }

    /// Named fields of the latest revision, for default projections.
    #[must_use]
    pub fn field_names(&self, qualified_name: &str, namespace: u32) -> Option<Vec<String>> {
        let descriptor = self.resolve(namespace, qualified_name, LATEST_REVISION).ok()?;
        Some(
            descriptor
                .fields
                .iter()
                .filter(|f| !f.is_placeholder())
                .map(|f| f.name.clone())
                .collect(),
        )
    }
}
