//! Execution contexts
//!
//! A [`Context`] is one execution scope, typically one request. It owns the
//! sinks scripts write to, the header map they mutate, and every value bound
//! into it.

use crate::engine::EngineState;
use crate::error::{BridgeError, Result};
use crate::runtime::{ContextHandle, HeaderOp, Runtime};
use crate::value::{HostValue, Value};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

type Sink = Mutex<Option<Box<dyn Write + Send>>>;
type Source = Mutex<Option<Box<dyn Read + Send>>>;

/// Context data shared with callback dispatch
pub(crate) struct ContextState {
    handle: ContextHandle,
    live: AtomicBool,
    output: Sink,
    log: Sink,
    input: Source,
    headers: RwLock<HeaderMap>,
    values: Mutex<HashMap<String, Value>>,
}

impl fmt::Debug for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextState")
            .field("handle", &self.handle)
            .field("live", &self.live.load(Ordering::Acquire))
            .field("headers", &*self.headers.read())
            .field("values", &self.values.lock().len())
            .finish()
    }
}

impl ContextState {
    pub(crate) fn new(handle: ContextHandle) -> Self {
        Self {
            handle,
            live: AtomicBool::new(true),
            output: Mutex::new(None),
            log: Mutex::new(None),
            input: Mutex::new(None),
            headers: RwLock::new(HeaderMap::new()),
            values: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn write_output(&self, bytes: &[u8]) -> io::Result<usize> {
        write_sink(&self.output, bytes)
    }

    pub(crate) fn write_log(&self, bytes: &[u8]) -> io::Result<usize> {
        write_sink(&self.log, bytes)
    }

    pub(crate) fn read_input(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.input.lock().as_mut() {
            Some(source) => source.read(buf),
            None => Ok(0),
        }
    }

    pub(crate) fn set_header(&self, op: HeaderOp, line: &str) {
        apply_header(&mut self.headers.write(), op, line);
    }

    /// Release every bound value and the interpreter scope, once.
    pub(crate) fn destroy(&self, runtime: &dyn Runtime) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }

        let values: Vec<Value> = self.values.lock().drain().map(|(_, value)| value).collect();
        let released = values.len();
        for mut value in values {
            value.destroy();
        }
        runtime.context_destroy(self.handle);

        debug!(context = self.handle.0, released, "context destroyed");
    }
}

/// Unset sinks swallow everything.
fn write_sink(sink: &Sink, bytes: &[u8]) -> io::Result<usize> {
    match sink.lock().as_mut() {
        Some(writer) => {
            writer.write_all(bytes)?;
            Ok(bytes.len())
        }
        None => Ok(bytes.len()),
    }
}

/// Apply a header mutation requested by a script.
///
/// `line` is split on its first colon; both halves are trimmed. Replace and
/// append need a value, delete only looks at the name.
pub(crate) fn apply_header(headers: &mut HeaderMap, op: HeaderOp, line: &str) {
    let (name, value) = match line.split_once(':') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => (line.trim(), ""),
    };
    if name.is_empty() {
        return;
    }

    let header = match HeaderName::from_bytes(name.as_bytes()) {
        Ok(header) => header,
        Err(e) => {
            warn!(header = name, error = %e, "ignoring invalid header name");
            return;
        }
    };

    if op == HeaderOp::Delete {
        headers.remove(&header);
        return;
    }
    if value.is_empty() {
        return;
    }

    let value = match HeaderValue::from_str(value) {
        Ok(value) => value,
        Err(e) => {
            warn!(header = name, error = %e, "ignoring invalid header value");
            return;
        }
    };

    match op {
        HeaderOp::Replace => {
            headers.insert(header, value);
        }
        HeaderOp::Append => {
            headers.append(header, value);
        }
        HeaderOp::Delete => {}
    }
}

/// One execution scope.
///
/// Contexts stay on the thread that created them; the interpreter is not
/// entered for the same scope from two threads.
pub struct Context {
    state: Arc<ContextState>,
    engine: Arc<EngineState>,
    _thread: PhantomData<*const ()>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.state.handle)
            .field("live", &self.state.is_live())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(state: Arc<ContextState>, engine: Arc<EngineState>) -> Self {
        Self {
            state,
            engine,
            _thread: PhantomData,
        }
    }

    /// Interpreter handle of this scope
    pub fn handle(&self) -> ContextHandle {
        self.state.handle
    }

    /// Whether the context has not been destroyed
    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.is_live() {
            Ok(())
        } else {
            Err(BridgeError::invalid_handle(format!(
                "context {} has been destroyed",
                self.state.handle.0
            )))
        }
    }

    fn runtime(&self) -> &Arc<dyn Runtime> {
        self.engine.runtime()
    }

    /// Send script output to `writer`
    pub fn set_output(&self, writer: impl Write + Send + 'static) {
        *self.state.output.lock() = Some(Box::new(writer));
    }

    /// Send script diagnostics to `writer`
    pub fn set_log(&self, writer: impl Write + Send + 'static) {
        *self.state.log.lock() = Some(Box::new(writer));
    }

    /// Let scripts read from `reader`
    pub fn set_input(&self, reader: impl Read + Send + 'static) {
        *self.state.input.lock() = Some(Box::new(reader));
    }

    /// Snapshot of the headers set by scripts
    pub fn headers(&self) -> HeaderMap {
        self.state.headers.read().clone()
    }

    /// Values of one header in insertion order
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.state
            .headers
            .read()
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    /// Make `value` visible to scripts as `name`.
    ///
    /// A previous binding under the same name is released.
    pub fn bind(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        self.ensure_live()?;

        let mut value = Value::from_host(self.runtime(), &value.into())?;
        let raw = value
            .raw()
            .ok_or_else(|| BridgeError::invalid_handle("value was released"))?;

        if let Err(e) = self.runtime().context_bind(self.state.handle, name, raw) {
            value.destroy();
            return Err(BridgeError::Bind {
                name: name.to_string(),
                message: e.to_string(),
            });
        }

        let previous = self.state.values.lock().insert(name.to_string(), value);
        if let Some(mut previous) = previous {
            previous.destroy();
        }

        trace!(context = self.state.handle.0, name, "value bound");
        Ok(())
    }

    /// Host copy of a bound value
    pub fn bound(&self, name: &str) -> Option<HostValue> {
        self.state
            .values
            .lock()
            .get(name)
            .map(Value::interface)
    }

    /// Run a script file in this scope
    pub fn exec(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.ensure_live()?;

        self.runtime()
            .context_exec(self.state.handle, path)
            .map_err(|e| BridgeError::Execution {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Evaluate an expression in this scope and return its value.
    ///
    /// Variables declared by `expression` do not outlive the call.
    pub fn eval(&self, expression: &str) -> Result<Value> {
        self.ensure_live()?;

        let raw = self
            .runtime()
            .context_eval(self.state.handle, expression)
            .map_err(|e| BridgeError::Evaluation {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;

        Value::from_raw(Arc::clone(self.runtime()), raw)
    }

    /// Release every bound value and the interpreter scope.
    ///
    /// Destroying twice is harmless.
    pub fn destroy(&mut self) {
        self.engine.destroy_context(&self.state);
    }
}
