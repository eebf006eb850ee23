//! Host types exposed to scripts as constructible classes

use crate::error::{BridgeError, Result};
use crate::runtime::ObjectHandle;
use crate::value::HostValue;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A host object instance that scripts can use
pub trait Object: Send {
    /// Read a property
    fn get(&self, property: &str) -> Result<HostValue>;

    /// Write a property
    fn set(&mut self, property: &str, value: HostValue);

    /// Whether a property exists
    fn exists(&self, property: &str) -> bool;

    /// Invoke a method. `Ok(None)` means the method returned nothing.
    fn call(&mut self, method: &str, args: Vec<HostValue>) -> Result<Option<HostValue>>;
}

/// Builds a host object from constructor arguments
pub type Constructor = Arc<dyn Fn(&[HostValue]) -> Result<Box<dyn Object>> + Send + Sync>;

type Instance = Arc<Mutex<Box<dyn Object>>>;

/// Descriptor of one host type exposed to scripts.
///
/// Keeps the instances scripts have created, keyed by the handle the
/// interpreter assigned to each.
pub struct Receiver {
    name: String,
    constructor: Constructor,
    objects: RwLock<HashMap<ObjectHandle, Instance>>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("objects", &self.objects.read().len())
            .finish()
    }
}

impl Receiver {
    /// Create a receiver named `name`; scripts construct it as `name(...)`
    pub fn new<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<Box<dyn Object>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            constructor: Arc::new(constructor),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether no instance is live
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Whether `handle` resolves to a live instance
    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.objects.read().contains_key(&handle)
    }

    /// Run the constructor and record the instance under `handle`
    pub(crate) fn construct(&self, handle: ObjectHandle, args: &[HostValue]) -> Result<()> {
        let instance = (self.constructor)(args).map_err(|e| match e {
            err @ BridgeError::Receiver { .. } => err,
            other => BridgeError::receiver(&self.name, other.to_string()),
        })?;

        match self.objects.write().entry(handle) {
            Entry::Occupied(_) => {
                return Err(BridgeError::receiver(
                    &self.name,
                    format!("object {} already exists", handle.0),
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(instance)));
            }
        }

        trace!(receiver = %self.name, object = handle.0, "instance constructed");
        Ok(())
    }

    /// Forget an instance. Unknown handles are ignored.
    pub(crate) fn destroy(&self, handle: ObjectHandle) -> bool {
        let removed = self.objects.write().remove(&handle);
        if removed.is_some() {
            trace!(receiver = %self.name, object = handle.0, "instance destroyed");
        }
        removed.is_some()
    }

    /// Drop every instance
    pub(crate) fn clear(&self) {
        let objects = std::mem::take(&mut *self.objects.write());
        if !objects.is_empty() {
            trace!(receiver = %self.name, count = objects.len(), "object table cleared");
        }
    }

    fn instance(&self, handle: ObjectHandle) -> Option<Instance> {
        self.objects.read().get(&handle).cloned()
    }

    /// Read a property; `None` for unknown handles and failed reads
    pub fn get(&self, handle: ObjectHandle, property: &str) -> Option<HostValue> {
        let instance = self.instance(handle)?;
        let result = instance.lock().get(property);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                trace!(receiver = %self.name, object = handle.0, property, error = %e, "property read failed");
                None
            }
        }
    }

    /// Write a property; unknown handles are ignored
    pub fn set(&self, handle: ObjectHandle, property: &str, value: HostValue) {
        if let Some(instance) = self.instance(handle) {
            instance.lock().set(property, value);
        }
    }

    /// Whether a property exists; `false` for unknown handles
    pub fn exists(&self, handle: ObjectHandle, property: &str) -> bool {
        let Some(instance) = self.instance(handle) else {
            return false;
        };
        let exists = instance.lock().exists(property);
        exists
    }

    /// Invoke a method; `Ok(None)` for unknown handles
    pub fn call(
        &self,
        handle: ObjectHandle,
        method: &str,
        args: Vec<HostValue>,
    ) -> Result<Option<HostValue>> {
        let Some(instance) = self.instance(handle) else {
            return Ok(None);
        };
        let result = instance.lock().call(method, args);
        result
    }
}
