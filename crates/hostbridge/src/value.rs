//! Host values and their conversion to and from interpreter values
//!
//! [`HostValue`] is the closed set of shapes the host can hand to scripts.
//! [`Value`] owns exactly one interpreter handle and is released with
//! [`Value::destroy`]; nothing is released implicitly.

use crate::error::{BridgeError, Result};
use crate::runtime::{Kind, RawHandle, Runtime};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A value on the host side of the bridge
#[derive(Debug, Clone, Default)]
pub enum HostValue {
    /// No value
    #[default]
    Null,
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Text
    Text(String),
    /// Ordered sequence
    List(Vec<HostValue>),
    /// Mapping; keys must be [`HostValue::Int`] or [`HostValue::Text`]
    Map(Vec<(HostValue, HostValue)>),
    /// Structured record, exposed as an object
    Record(Record),
}

impl HostValue {
    /// Build a text-keyed mapping
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<HostValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(key, value)| (HostValue::Text(key.into()), value.into()))
                .collect(),
        )
    }

    /// Shape name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Record(_) => "record",
        }
    }

    /// Whether this is [`HostValue::Null`]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer content, if this is an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Float content; integers widen
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Text content, if this is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Look up a text key in a mapping
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            Self::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Reject mapping keys that are neither integers nor text, anywhere in
    /// the tree
    fn validate(&self) -> Result<()> {
        match self {
            Self::List(items) => items.iter().try_for_each(Self::validate),
            Self::Map(entries) => entries.iter().try_for_each(|(key, value)| {
                match key {
                    Self::Int(_) | Self::Text(_) => {}
                    other => {
                        return Err(BridgeError::InvalidType {
                            type_name: other.type_name(),
                            value: other.to_string(),
                        })
                    }
                }
                value.validate()
            }),
            Self::Record(record) => record
                .exported()
                .try_for_each(|field| field.value.validate()),
            _ => Ok(()),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, value)| b.iter().any(|(k, v)| k == key && v == value))
            }
            (Self::Record(a), Self::Record(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Record(record) => write!(f, "{} {{..}}", record.name),
        }
    }
}

/// Structured record with named fields
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Record type name
    pub name: String,
    /// Fields in declaration order
    pub fields: Vec<Field>,
}

/// One field of a [`Record`]
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Field value
    pub value: HostValue,
    /// Whether the field is visible outside its type
    pub exported: bool,
}

impl Record {
    /// Create an empty record
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add an exported field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
            exported: true,
        });
        self
    }

    /// Add a field that is not exported
    pub fn private_field(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
            exported: false,
        });
        self
    }

    /// Exported fields
    pub fn exported(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|field| field.exported)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for HostValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Record> for HostValue {
    fn from(value: Record) -> Self {
        Self::Record(value)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Self::Text(s),
            Json::Array(items) => Self::List(items.into_iter().map(Into::into).collect()),
            Json::Object(entries) => Self::map(entries),
        }
    }
}

impl From<HostValue> for serde_json::Value {
    fn from(value: HostValue) -> Self {
        use serde_json::Value as Json;

        match value {
            HostValue::Null => Json::Null,
            HostValue::Int(i) => Json::from(i),
            HostValue::Float(f) => Json::from(f),
            HostValue::Bool(b) => Json::Bool(b),
            HostValue::Text(s) => Json::String(s),
            HostValue::List(items) => Json::Array(items.into_iter().map(Into::into).collect()),
            HostValue::Map(entries) => Json::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| {
                        let key = match key {
                            HostValue::Text(s) => s,
                            other => other.to_string(),
                        };
                        (key, value.into())
                    })
                    .collect(),
            ),
            HostValue::Record(record) => Json::Object(
                record
                    .fields
                    .into_iter()
                    .filter(|field| field.exported)
                    .map(|field| (field.name, field.value.into()))
                    .collect(),
            ),
        }
    }
}

/// Handle released on drop unless taken out.
///
/// Only used while building containers, so a failure half way through a
/// nested value frees everything allocated so far.
struct OwnedHandle<'a> {
    runtime: &'a dyn Runtime,
    handle: Option<RawHandle>,
}

impl<'a> OwnedHandle<'a> {
    fn new(runtime: &'a dyn Runtime, handle: RawHandle) -> Self {
        Self {
            runtime,
            handle: Some(handle),
        }
    }

    fn get(&self) -> RawHandle {
        self.handle.unwrap_or(RawHandle::NULL)
    }

    fn release(mut self) -> RawHandle {
        self.handle.take().unwrap_or(RawHandle::NULL)
    }
}

impl Drop for OwnedHandle<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.runtime.destroy(handle);
        }
    }
}

fn allocated(handle: Option<RawHandle>, value: &HostValue) -> Result<RawHandle> {
    handle.ok_or_else(|| BridgeError::Allocation(value.to_string()))
}

fn build(runtime: &dyn Runtime, value: &HostValue) -> Result<RawHandle> {
    match value {
        HostValue::Null => allocated(runtime.create_null(), value),
        HostValue::Int(i) => allocated(runtime.create_long(*i), value),
        HostValue::Float(f) => allocated(runtime.create_double(*f), value),
        HostValue::Bool(b) => allocated(runtime.create_bool(*b), value),
        HostValue::Text(s) => allocated(runtime.create_string(s), value),
        HostValue::List(items) => {
            let array = OwnedHandle::new(runtime, allocated(runtime.create_array(items.len()), value)?);
            for item in items {
                let child = build(runtime, item)?;
                runtime.array_push(array.get(), child)?;
            }
            Ok(array.release())
        }
        HostValue::Map(entries) => {
            let array = OwnedHandle::new(runtime, allocated(runtime.create_array(entries.len()), value)?);
            for (key, item) in entries {
                let child = build(runtime, item)?;
                match key {
                    HostValue::Int(index) => runtime.array_insert_index(array.get(), *index, child)?,
                    HostValue::Text(name) => runtime.array_insert_key(array.get(), name, child)?,
                    other => {
                        runtime.destroy(child);
                        return Err(BridgeError::InvalidType {
                            type_name: other.type_name(),
                            value: other.to_string(),
                        });
                    }
                }
            }
            Ok(array.release())
        }
        HostValue::Record(record) => {
            let object = OwnedHandle::new(runtime, allocated(runtime.create_object(), value)?);
            for field in record.exported() {
                let child = build(runtime, &field.value)?;
                runtime.object_set_property(object.get(), &field.name, child)?;
            }
            Ok(object.release())
        }
    }
}

/// A read needed a temporary handle and the runtime refused it.
fn refused(what: &str, handle: RawHandle) -> BridgeError {
    BridgeError::Allocation(format!("{what} of {handle}"))
}

fn extract(runtime: &dyn Runtime, handle: RawHandle) -> Result<HostValue> {
    Ok(match runtime.kind(handle) {
        None | Some(Kind::Null) => HostValue::Null,
        Some(Kind::Long) => HostValue::Int(runtime.get_long(handle)),
        Some(Kind::Double) => HostValue::Float(runtime.get_double(handle)),
        Some(Kind::Bool) => HostValue::Bool(runtime.get_bool(handle)),
        Some(Kind::String) => HostValue::Text(runtime.get_string(handle)),
        Some(Kind::Array) => HostValue::List(extract_list(runtime, handle)?),
        Some(Kind::Map | Kind::Object) => HostValue::Map(
            extract_entries(runtime, handle)?
                .into_iter()
                .map(|(key, value)| (HostValue::Text(key), value))
                .collect(),
        ),
    })
}

fn extract_list(runtime: &dyn Runtime, handle: RawHandle) -> Result<Vec<HostValue>> {
    let size = runtime.array_size(handle);
    let mut items = Vec::with_capacity(size);

    runtime.array_reset(handle);
    for position in 0..size {
        let item = runtime
            .array_next(handle)
            .ok_or_else(|| refused(&format!("element {position}"), handle))?;
        let item = OwnedHandle::new(runtime, item);
        items.push(extract(runtime, item.get())?);
    }

    Ok(items)
}

fn extract_entries(runtime: &dyn Runtime, handle: RawHandle) -> Result<Vec<(String, HostValue)>> {
    let keys = runtime
        .array_keys(handle)
        .ok_or_else(|| refused("keys", handle))?;
    let keys = OwnedHandle::new(runtime, keys);
    let size = runtime.array_size(keys.get());
    let mut entries = Vec::with_capacity(size);

    for position in 0..size {
        let key = runtime
            .array_index(keys.get(), position as i64)
            .ok_or_else(|| refused(&format!("key {position}"), handle))?;
        let key = OwnedHandle::new(runtime, key);
        let name = runtime.get_string(key.get());

        let item = match runtime.kind(key.get()) {
            Some(Kind::Long) => runtime.array_index(handle, runtime.get_long(key.get())),
            _ => runtime.array_key(handle, &name),
        }
        .ok_or_else(|| refused(&format!("entry '{name}'"), handle))?;
        let item = OwnedHandle::new(runtime, item);

        entries.push((name, extract(runtime, item.get())?));
    }

    Ok(entries)
}

/// An owned interpreter value
#[derive(Debug)]
pub struct Value {
    runtime: Arc<dyn Runtime>,
    handle: Option<RawHandle>,
}

impl Value {
    /// Convert a host value into a new interpreter value.
    ///
    /// Nothing is allocated when a mapping key is invalid, and everything
    /// allocated is released again when an allocation fails part way.
    pub fn from_host(runtime: &Arc<dyn Runtime>, value: &HostValue) -> Result<Self> {
        value.validate()?;
        let handle = build(runtime.as_ref(), value)?;

        Ok(Self {
            runtime: Arc::clone(runtime),
            handle: Some(handle),
        })
    }

    /// Take ownership of a handle produced by the interpreter
    pub fn from_raw(runtime: Arc<dyn Runtime>, handle: RawHandle) -> Result<Self> {
        if handle.is_null() {
            return Err(BridgeError::invalid_handle("null value handle"));
        }
        if runtime.kind(handle).is_none() {
            return Err(BridgeError::invalid_handle(format!("unknown value handle {handle}")));
        }

        Ok(Self {
            runtime,
            handle: Some(handle),
        })
    }

    /// Underlying handle, `None` once destroyed
    pub fn raw(&self) -> Option<RawHandle> {
        self.handle
    }

    /// Give up ownership of the handle
    pub fn into_raw(mut self) -> Option<RawHandle> {
        self.handle.take()
    }

    /// Whether the value has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.handle.is_none()
    }

    /// Kind of the value; destroyed values read as [`Kind::Null`]
    pub fn kind(&self) -> Kind {
        self.handle
            .and_then(|handle| self.runtime.kind(handle))
            .unwrap_or(Kind::Null)
    }

    /// Convert back to a host value.
    ///
    /// Reading a container needs temporary handles; when the runtime refuses
    /// one the read fails with [`BridgeError::Allocation`] instead of
    /// returning a shortened value.
    pub fn try_interface(&self) -> Result<HostValue> {
        match self.handle {
            Some(handle) => extract(self.runtime.as_ref(), handle),
            None => Ok(HostValue::Null),
        }
    }

    /// Convert back to a host value; [`HostValue::Null`] if the read fails
    pub fn interface(&self) -> HostValue {
        self.try_interface().unwrap_or_else(|e| {
            warn!(error = %e, "value could not be read");
            HostValue::Null
        })
    }

    /// Read as integer
    pub fn int(&self) -> i64 {
        self.handle
            .map(|handle| self.runtime.get_long(handle))
            .unwrap_or_default()
    }

    /// Read as floating point number
    pub fn float(&self) -> f64 {
        self.handle
            .map(|handle| self.runtime.get_double(handle))
            .unwrap_or_default()
    }

    /// Read as boolean
    pub fn bool(&self) -> bool {
        self.handle
            .map(|handle| self.runtime.get_bool(handle))
            .unwrap_or_default()
    }

    /// Read as string
    pub fn string(&self) -> String {
        self.handle
            .map(|handle| self.runtime.get_string(handle))
            .unwrap_or_default()
    }

    /// Elements in iteration order. Scalars read as a one-element list.
    pub fn try_slice(&self) -> Result<Vec<HostValue>> {
        match self.handle {
            Some(handle) => extract_list(self.runtime.as_ref(), handle),
            None => Ok(Vec::new()),
        }
    }

    /// Like [`Value::try_slice`]; empty if the read fails
    pub fn slice(&self) -> Vec<HostValue> {
        self.try_slice().unwrap_or_else(|e| {
            warn!(error = %e, "elements could not be read");
            Vec::new()
        })
    }

    /// Entries keyed by text; integer keys are rendered as text
    pub fn try_map(&self) -> Result<HashMap<String, HostValue>> {
        match self.handle {
            Some(handle) => Ok(extract_entries(self.runtime.as_ref(), handle)?
                .into_iter()
                .collect()),
            None => Ok(HashMap::new()),
        }
    }

    /// Like [`Value::try_map`]; empty if the read fails
    pub fn map(&self) -> HashMap<String, HostValue> {
        self.try_map().unwrap_or_else(|e| {
            warn!(error = %e, "entries could not be read");
            HashMap::new()
        })
    }

    /// Release the handle. Calling this again does nothing.
    pub fn destroy(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.runtime.destroy(handle);
        }
    }
}
