//! Engine lifecycle and callback dispatch
//!
//! Only one [`Engine`] may be active per process because the interpreter it
//! drives is process-wide state. The engine owns every live [`Context`] and
//! every [`Receiver`], and routes the interpreter's callbacks to them.

use crate::context::{Context, ContextState};
use crate::error::{BridgeError, Result};
use crate::receiver::Receiver;
use crate::runtime::{Callbacks, ContextHandle, HeaderOp, ObjectHandle, RawHandle, RhaiRuntime, Runtime};
use crate::value::{HostValue, Value};
use hostbridge_config::{BridgeConfig, RuntimeConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// State shared between the engine, its contexts and the interpreter
pub(crate) struct EngineState {
    runtime: Arc<dyn Runtime>,
    contexts: RwLock<HashMap<ContextHandle, Arc<ContextState>>>,
    receivers: HashMap<String, Arc<Receiver>>,
    running: AtomicBool,
}

impl fmt::Debug for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineState")
            .field("runtime", &self.runtime.name())
            .field("contexts", &self.contexts.read().len())
            .field("receivers", &self.receivers.keys().collect::<Vec<_>>())
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

impl EngineState {
    pub(crate) fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub(crate) fn destroy_context(&self, state: &Arc<ContextState>) {
        state.destroy(self.runtime.as_ref());
        self.contexts.write().remove(&state.handle());
    }

    fn context(&self, ctx: ContextHandle) -> Option<Arc<ContextState>> {
        let state = self.contexts.read().get(&ctx).cloned();
        if state.is_none() {
            warn!(context = ctx.0, "callback for unknown context");
        }
        state
    }

    fn receiver(&self, class: &str) -> Option<&Arc<Receiver>> {
        let receiver = self.receivers.get(class);
        if receiver.is_none() {
            warn!(receiver = class, "callback for unknown receiver");
        }
        receiver
    }

    /// Convert a handle handed over by the interpreter and release it.
    ///
    /// The handle is released whether or not it could be read.
    fn take(&self, handle: RawHandle) -> Result<HostValue> {
        let mut value = Value::from_raw(Arc::clone(&self.runtime), handle)?;
        let host = value.try_interface();
        value.destroy();
        host
    }

    /// Convert a host value into a handle handed over to the interpreter.
    fn give(&self, value: &HostValue) -> Result<RawHandle> {
        Value::from_host(&self.runtime, value)?
            .into_raw()
            .ok_or_else(|| BridgeError::invalid_handle("value was released"))
    }

    fn arguments(&self, handle: RawHandle) -> Result<Vec<HostValue>> {
        Ok(match self.take(handle)? {
            HostValue::List(items) => items,
            HostValue::Null => Vec::new(),
            other => vec![other],
        })
    }
}

impl Callbacks for EngineState {
    fn write_output(&self, ctx: ContextHandle, bytes: &[u8]) -> io::Result<usize> {
        match self.context(ctx) {
            Some(state) => state.write_output(bytes),
            None => Ok(bytes.len()),
        }
    }

    fn write_log(&self, ctx: ContextHandle, bytes: &[u8]) -> io::Result<usize> {
        match self.context(ctx) {
            Some(state) => state.write_log(bytes),
            None => Ok(bytes.len()),
        }
    }

    fn read_input(&self, ctx: ContextHandle, buf: &mut [u8]) -> io::Result<usize> {
        match self.context(ctx) {
            Some(state) => state.read_input(buf),
            None => Ok(0),
        }
    }

    fn set_header(&self, ctx: ContextHandle, op: HeaderOp, line: &str) {
        if let Some(state) = self.context(ctx) {
            state.set_header(op, line);
        }
    }

    fn receiver_construct(&self, class: &str, object: ObjectHandle, args: RawHandle) -> bool {
        let result = self.arguments(args).and_then(|args| {
            self.receivers
                .get(class)
                .ok_or_else(|| BridgeError::UnknownReceiver(class.to_string()))?
                .construct(object, &args)
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(receiver = class, object = object.0, error = %e, "construction failed");
                false
            }
        }
    }

    fn receiver_destroy(&self, class: &str, object: ObjectHandle) {
        if let Some(receiver) = self.receivers.get(class) {
            receiver.destroy(object);
        }
    }

    fn receiver_get(&self, class: &str, object: ObjectHandle, property: &str) -> Option<RawHandle> {
        trace!(receiver = class, object = object.0, property, "get");
        let value = self.receiver(class)?.get(object, property)?;

        match self.give(&value) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(receiver = class, property, error = %e, "cannot convert property value");
                None
            }
        }
    }

    fn receiver_set(&self, class: &str, object: ObjectHandle, property: &str, value: RawHandle) {
        trace!(receiver = class, object = object.0, property, "set");
        let value = match self.take(value) {
            Ok(value) => value,
            Err(e) => {
                warn!(receiver = class, property, error = %e, "cannot convert property value");
                return;
            }
        };

        if let Some(receiver) = self.receiver(class) {
            receiver.set(object, property, value);
        }
    }

    fn receiver_exists(&self, class: &str, object: ObjectHandle, property: &str) -> bool {
        self.receiver(class)
            .map(|receiver| receiver.exists(object, property))
            .unwrap_or(false)
    }

    fn receiver_call(
        &self,
        class: &str,
        object: ObjectHandle,
        method: &str,
        args: RawHandle,
    ) -> Result<Option<RawHandle>> {
        trace!(receiver = class, object = object.0, method, "call");
        let args = self.arguments(args)?;
        let Some(receiver) = self.receiver(class) else {
            return Ok(None);
        };

        match receiver.call(object, method, args)? {
            None | Some(HostValue::Null) => Ok(None),
            Some(value) => self.give(&value).map(Some),
        }
    }
}

/// The process-wide bridge to the embedded interpreter
pub struct Engine {
    state: Arc<EngineState>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").field("state", &self.state).finish()
    }
}

impl Engine {
    /// Start the rhai interpreter with default settings
    pub fn start(receivers: Vec<Receiver>) -> Result<Self> {
        Self::start_with_config(receivers, &RuntimeConfig::default())
    }

    /// Start the rhai interpreter with explicit limits
    pub fn start_with_config(receivers: Vec<Receiver>, config: &RuntimeConfig) -> Result<Self> {
        Self::start_with_runtime(Arc::new(RhaiRuntime::new(config.clone())), receivers)
    }

    /// Start from a loaded configuration file
    pub fn from_config(receivers: Vec<Receiver>, config: &BridgeConfig) -> Result<Self> {
        hostbridge_config::validate_config(config)?;
        Self::start_with_config(receivers, &config.runtime)
    }

    /// Start an arbitrary interpreter.
    ///
    /// Every receiver is declared before the interpreter boots. Fails with
    /// [`BridgeError::AlreadyActive`] while another engine is running.
    pub fn start_with_runtime(runtime: Arc<dyn Runtime>, receivers: Vec<Receiver>) -> Result<Self> {
        let mut table = HashMap::with_capacity(receivers.len());
        for receiver in receivers {
            let name = receiver.name().to_string();
            if table.contains_key(&name) {
                return Err(BridgeError::DuplicateReceiver(name));
            }
            table.insert(name, Arc::new(receiver));
        }

        if ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::AlreadyActive);
        }

        let state = Arc::new(EngineState {
            runtime: Arc::clone(&runtime),
            contexts: RwLock::new(HashMap::new()),
            receivers: table,
            running: AtomicBool::new(true),
        });

        let booted = state
            .receivers
            .keys()
            .try_for_each(|name| runtime.define_class(name))
            .and_then(|()| runtime.startup(state.clone()));
        if let Err(e) = booted {
            ACTIVE.store(false, Ordering::Release);
            return Err(BridgeError::Initialization(e.to_string()));
        }

        info!(
            runtime = runtime.name(),
            receivers = state.receivers.len(),
            "engine started"
        );
        Ok(Self { state })
    }

    /// Whether an engine is active in this process
    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }

    /// Whether this engine has not been shut down
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// The interpreter behind this engine
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.state.runtime
    }

    /// Registered receiver by name
    pub fn receiver(&self, name: &str) -> Option<Arc<Receiver>> {
        self.state.receivers.get(name).cloned()
    }

    /// Number of live contexts
    pub fn context_count(&self) -> usize {
        self.state.contexts.read().len()
    }

    /// Create an execution scope
    pub fn new_context(&self) -> Result<Context> {
        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }

        let handle = self
            .state
            .runtime
            .context_new()
            .map_err(|e| BridgeError::ContextInitialization(e.to_string()))?;
        let context = Arc::new(ContextState::new(handle));
        self.state.contexts.write().insert(handle, context.clone());

        debug!(context = handle.0, "context created");
        Ok(Context::new(context, self.state.clone()))
    }

    /// Destroy a context and forget it
    pub fn destroy_context(&self, context: &mut Context) {
        context.destroy();
    }

    /// Convert a host value into an interpreter value
    pub fn new_value(&self, value: &HostValue) -> Result<Value> {
        Value::from_host(&self.state.runtime, value)
    }

    /// Stop the interpreter, then tear down every receiver table and every
    /// context. Does nothing once the engine is stopped.
    pub fn shutdown(&self) {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.state.runtime.shutdown();

        for receiver in self.state.receivers.values() {
            receiver.clear();
        }

        let contexts: Vec<_> = self
            .state
            .contexts
            .write()
            .drain()
            .map(|(_, state)| state)
            .collect();
        let destroyed = contexts.len();
        for context in contexts {
            context.destroy(self.state.runtime.as_ref());
        }

        ACTIVE.store(false, Ordering::Release);
        info!(contexts = destroyed, "engine stopped");
    }
}
