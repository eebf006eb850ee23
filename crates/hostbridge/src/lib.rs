//! # Hostbridge
//!
//! Embeds a script interpreter in a host program and bridges values and
//! objects across the boundary.
//!
//! ## Components
//!
//! - **Value** - one interpreter value, converted to and from [`HostValue`]
//! - **Receiver** - a host type scripts can construct and call into
//! - **Context** - one execution scope with its own output, headers and bindings
//! - **Engine** - the process-wide owner of contexts and receivers
//!
//! ## Example
//!
//! ```rust,no_run
//! use hostbridge::prelude::*;
//!
//! let engine = Engine::start(vec![])?;
//! let mut ctx = engine.new_context()?;
//!
//! ctx.bind("name", "world")?;
//! let mut greeting = ctx.eval(r#""hello " + name"#)?;
//! assert_eq!(greeting.string(), "hello world");
//!
//! greeting.destroy();
//! ctx.destroy();
//! engine.shutdown();
//! # Ok::<(), hostbridge::BridgeError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod context;
pub mod engine;
pub mod error;
pub mod receiver;
pub mod runtime;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::Context;
pub use engine::Engine;
pub use error::{BridgeError, Result};
pub use receiver::{Constructor, Object, Receiver};
pub use runtime::{Callbacks, ContextHandle, HeaderOp, Kind, ObjectHandle, RawHandle, RhaiRuntime, Runtime};
pub use value::{Field, HostValue, Record, Value};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::engine::Engine;
    pub use crate::error::{BridgeError, Result};
    pub use crate::receiver::{Object, Receiver};
    pub use crate::runtime::Kind;
    pub use crate::value::{HostValue, Record, Value};
}
