//! Boundary with the embedded interpreter
//!
//! The core never touches interpreter memory directly. It speaks to a
//! [`Runtime`] through opaque handles, and the runtime calls back into the
//! host through [`Callbacks`] while a script is executing.
//!
//! Ownership across the boundary:
//! - every `create_*`, `array_*` getter, `array_keys` and `context_eval`
//!   returns a fresh handle owned by the caller;
//! - `array_push`, `array_insert_*` and `object_set_property` consume the
//!   child handle, also when they fail;
//! - handles passed into a callback are owned by the callback, and handles
//!   returned from a callback are owned by the runtime.

pub mod arena;
pub mod rhai_runtime;

pub use self::arena::{ArenaStats, HandleArena};
pub use self::rhai_runtime::{ReceiverRef, RhaiRuntime, StdObject};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Opaque handle to a value living inside the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(u64);

impl RawHandle {
    /// The null handle
    pub const NULL: RawHandle = RawHandle(0);

    /// Wrap a raw handle id
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw handle id
    pub const fn id(self) -> u64 {
        self.0
    }

    /// Whether this is the null handle
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque handle to an interpreter execution scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Opaque handle to a receiver instance created by a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

/// Kind of an interpreter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// No value
    Null,
    /// Integer
    Long,
    /// Floating point number
    Double,
    /// Boolean
    Bool,
    /// Indexed array (keys `0..n-1` in order)
    Array,
    /// Object with named properties
    Object,
    /// String
    String,
    /// Associative array
    Map,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Long => "long",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
            Self::String => "string",
            Self::Map => "map",
        };
        f.write_str(name)
    }
}

/// Header mutation requested by a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOp {
    /// Replace every value of the header
    Replace,
    /// Add a value to the header
    Append,
    /// Remove the header
    Delete,
}

/// The embedded interpreter, as seen by the core
pub trait Runtime: Send + Sync + fmt::Debug {
    /// Interpreter name, for diagnostics
    fn name(&self) -> &str;

    /// Declare a receiver class. Only legal before [`Runtime::startup`].
    fn define_class(&self, name: &str) -> Result<()>;

    /// Boot the interpreter. Callbacks are delivered to `callbacks` until
    /// [`Runtime::shutdown`].
    fn startup(&self, callbacks: Arc<dyn Callbacks>) -> Result<()>;

    /// Stop the interpreter; no callback is delivered afterwards.
    fn shutdown(&self);

    /// Create an execution scope
    fn context_new(&self) -> Result<ContextHandle>;

    /// Make `value` visible to scripts under `name`. The handle stays owned
    /// by the caller.
    fn context_bind(&self, ctx: ContextHandle, name: &str, value: RawHandle) -> Result<()>;

    /// Run a script file
    fn context_exec(&self, ctx: ContextHandle, path: &Path) -> Result<()>;

    /// Evaluate an expression and return its value
    fn context_eval(&self, ctx: ContextHandle, script: &str) -> Result<RawHandle>;

    /// Tear down an execution scope
    fn context_destroy(&self, ctx: ContextHandle);

    /// Allocate a null value
    fn create_null(&self) -> Option<RawHandle>;
    /// Allocate an integer
    fn create_long(&self, value: i64) -> Option<RawHandle>;
    /// Allocate a floating point number
    fn create_double(&self, value: f64) -> Option<RawHandle>;
    /// Allocate a boolean
    fn create_bool(&self, value: bool) -> Option<RawHandle>;
    /// Allocate a string
    fn create_string(&self, value: &str) -> Option<RawHandle>;
    /// Allocate an empty array with room for `size` elements
    fn create_array(&self, size: usize) -> Option<RawHandle>;
    /// Allocate an empty object
    fn create_object(&self) -> Option<RawHandle>;

    /// Append `value` at the next index
    fn array_push(&self, array: RawHandle, value: RawHandle) -> Result<()>;
    /// Insert `value` under an integer key; the array becomes associative
    fn array_insert_index(&self, array: RawHandle, index: i64, value: RawHandle) -> Result<()>;
    /// Insert `value` under a string key; the array becomes associative
    fn array_insert_key(&self, array: RawHandle, key: &str, value: RawHandle) -> Result<()>;
    /// Attach `value` as a named property
    fn object_set_property(&self, object: RawHandle, name: &str, value: RawHandle) -> Result<()>;

    /// Kind of a live handle, `None` if the handle is unknown
    fn kind(&self, value: RawHandle) -> Option<Kind>;
    /// Read as integer, converting if necessary
    fn get_long(&self, value: RawHandle) -> i64;
    /// Read as floating point number, converting if necessary
    fn get_double(&self, value: RawHandle) -> f64;
    /// Read as boolean, converting if necessary
    fn get_bool(&self, value: RawHandle) -> bool;
    /// Read as string, converting if necessary
    fn get_string(&self, value: RawHandle) -> String;

    /// Number of elements; scalars count as one, null as zero
    fn array_size(&self, array: RawHandle) -> usize;
    /// Keys of an array, map or object as a new array handle
    fn array_keys(&self, array: RawHandle) -> Option<RawHandle>;
    /// Rewind the iteration cursor
    fn array_reset(&self, array: RawHandle);
    /// Copy of the element under the cursor, advancing it
    fn array_next(&self, array: RawHandle) -> Option<RawHandle>;
    /// Copy of the element under an integer key
    fn array_index(&self, array: RawHandle, index: i64) -> Option<RawHandle>;
    /// Copy of the element under a string key
    fn array_key(&self, array: RawHandle, key: &str) -> Option<RawHandle>;

    /// Release a handle
    fn destroy(&self, value: RawHandle);
}

/// Calls from the interpreter into the host
///
/// Invoked synchronously on the thread executing the script.
pub trait Callbacks: Send + Sync {
    /// Script output. Returns the number of bytes consumed.
    fn write_output(&self, ctx: ContextHandle, bytes: &[u8]) -> io::Result<usize>;

    /// Script diagnostics. Returns the number of bytes consumed.
    fn write_log(&self, ctx: ContextHandle, bytes: &[u8]) -> io::Result<usize>;

    /// Script input. Returns the number of bytes read, `0` at end of input.
    fn read_input(&self, ctx: ContextHandle, buf: &mut [u8]) -> io::Result<usize>;

    /// Header mutation; `line` is `name: value`, or only `name` for deletes.
    fn set_header(&self, ctx: ContextHandle, op: HeaderOp, line: &str);

    /// A script instantiated `class`. Owns `args`. Returns `false` on failure.
    fn receiver_construct(&self, class: &str, object: ObjectHandle, args: RawHandle) -> bool;

    /// The interpreter released a receiver instance
    fn receiver_destroy(&self, class: &str, object: ObjectHandle);

    /// Property read; `None` means no value
    fn receiver_get(&self, class: &str, object: ObjectHandle, property: &str) -> Option<RawHandle>;

    /// Property write. Owns `value`.
    fn receiver_set(&self, class: &str, object: ObjectHandle, property: &str, value: RawHandle);

    /// Property existence check
    fn receiver_exists(&self, class: &str, object: ObjectHandle, property: &str) -> bool;

    /// Method call. Owns `args`. `Ok(None)` means the method returned nothing.
    fn receiver_call(
        &self,
        class: &str,
        object: ObjectHandle,
        method: &str,
        args: RawHandle,
    ) -> Result<Option<RawHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_serialized_form() {
        for kind in [Kind::Null, Kind::Long, Kind::Map, Kind::Object] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_null_handle() {
        assert!(RawHandle::NULL.is_null());
        assert!(!RawHandle::from_raw(3).is_null());
        assert_eq!(RawHandle::from_raw(3).to_string(), "#3");
    }
}
