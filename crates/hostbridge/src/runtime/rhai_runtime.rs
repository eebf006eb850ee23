//! rhai-backed interpreter
//!
//! Values live in a [`HandleArena`]; each execution scope is a rhai
//! [`Scope`]. Receiver classes declared before startup become script
//! constructors, and the instances they return forward every property and
//! method access to the host through [`Callbacks`].

use super::{
    ArenaStats, Callbacks, ContextHandle, HandleArena, HeaderOp, Kind, ObjectHandle, RawHandle,
    Runtime,
};
use crate::error::{BridgeError, Result};
use hostbridge_config::RuntimeConfig;
use parking_lot::{Mutex, RwLock};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position, Scope, FLOAT, INT};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Largest chunk `read_input` hands to a script at once
const MAX_INPUT_CHUNK: usize = 64 * 1024;

thread_local! {
    static CURRENT: Cell<Option<ContextHandle>> = const { Cell::new(None) };
}

/// Marks the context whose script is running on this thread.
struct Activation {
    previous: Option<ContextHandle>,
}

impl Activation {
    fn enter(ctx: ContextHandle) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(ctx)));
        Self { previous }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

fn current_context() -> Option<ContextHandle> {
    CURRENT.with(|current| current.get())
}

fn script_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

/// Foreign `object`: a bag of named properties.
#[derive(Debug, Clone, Default)]
pub struct StdObject {
    properties: Map,
}

impl StdObject {
    /// Number of properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether the object has no properties
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Script-side reference to a host receiver instance.
///
/// Clones share one token; when the last clone is dropped the host is told
/// the instance is gone.
#[derive(Debug, Clone)]
pub struct ReceiverRef {
    class: ImmutableString,
    handle: ObjectHandle,
    _token: Arc<ObjectToken>,
}

impl ReceiverRef {
    /// Receiver class name
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Object handle known to the host
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }
}

#[derive(Debug)]
struct ObjectToken {
    class: ImmutableString,
    handle: ObjectHandle,
    shared: Weak<Shared>,
}

impl Drop for ObjectToken {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some(callbacks) = shared.callbacks() {
            trace!(class = %self.class, object = self.handle.0, "receiver instance released");
            callbacks.receiver_destroy(&self.class, self.handle);
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Dynamic,
    cursor: usize,
}

impl Slot {
    fn new(value: Dynamic) -> Self {
        Self { value, cursor: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Declaring,
    Running,
    Stopped,
}

/// State reachable from script callbacks
struct Shared {
    arena: Mutex<HandleArena<Slot>>,
    callbacks: RwLock<Option<Arc<dyn Callbacks>>>,
    next_object: AtomicU64,
    config: RuntimeConfig,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("arena", &self.arena.lock().stats())
            .field("connected", &self.callbacks.read().is_some())
            .finish()
    }
}

impl Shared {
    fn callbacks(&self) -> Option<Arc<dyn Callbacks>> {
        self.callbacks.read().clone()
    }

    fn alloc(&self, value: Dynamic) -> Option<RawHandle> {
        self.arena.lock().insert(Slot::new(value))
    }

    fn take(&self, handle: RawHandle) -> Option<Dynamic> {
        let slot = self.arena.lock().remove(handle);
        slot.map(|slot| slot.value)
    }

    fn read(&self, handle: RawHandle) -> Option<Dynamic> {
        self.arena.lock().get(handle).map(|slot| slot.value.clone())
    }

    fn write_output(&self, bytes: &[u8]) {
        let (Some(ctx), Some(callbacks)) = (current_context(), self.callbacks()) else {
            return;
        };
        match callbacks.write_output(ctx, bytes) {
            Ok(written) if written == bytes.len() => {}
            Ok(written) => {
                warn!(context = ctx.0, written, expected = bytes.len(), "short write to output sink")
            }
            Err(e) => warn!(context = ctx.0, error = %e, "output sink failed"),
        }
    }

    fn write_log(&self, bytes: &[u8]) {
        let (Some(ctx), Some(callbacks)) = (current_context(), self.callbacks()) else {
            return;
        };
        if let Err(e) = callbacks.write_log(ctx, bytes) {
            warn!(context = ctx.0, error = %e, "log sink failed");
        }
    }

    fn read_input(&self, max: INT) -> String {
        let (Some(ctx), Some(callbacks)) = (current_context(), self.callbacks()) else {
            return String::new();
        };
        let Ok(max) = usize::try_from(max) else {
            return String::new();
        };

        let mut buf = vec![0u8; max.min(MAX_INPUT_CHUNK)];
        match callbacks.read_input(ctx, &mut buf) {
            Ok(read) => String::from_utf8_lossy(&buf[..read.min(buf.len())]).into_owned(),
            Err(e) => {
                warn!(context = ctx.0, error = %e, "input source failed");
                String::new()
            }
        }
    }

    fn set_header(&self, op: HeaderOp, line: &str) {
        if let (Some(ctx), Some(callbacks)) = (current_context(), self.callbacks()) {
            callbacks.set_header(ctx, op, line);
        }
    }

    fn construct(self: &Arc<Self>, class: &ImmutableString, args: Array) -> ScriptResult<ReceiverRef> {
        let callbacks = self
            .callbacks()
            .ok_or_else(|| script_error("engine is not running"))?;
        let handle = ObjectHandle(self.next_object.fetch_add(1, Ordering::Relaxed));
        let args = self
            .alloc(Dynamic::from_array(args))
            .ok_or_else(|| script_error(format!("Unable to allocate arguments for '{class}'")))?;

        if !callbacks.receiver_construct(class, handle, args) {
            return Err(script_error(format!(
                "Failed to instantiate method receiver '{class}'"
            )));
        }

        Ok(ReceiverRef {
            class: class.clone(),
            handle,
            _token: Arc::new(ObjectToken {
                class: class.clone(),
                handle,
                shared: Arc::downgrade(self),
            }),
        })
    }

    fn receiver_get(&self, object: &ReceiverRef, property: &str) -> Dynamic {
        let Some(callbacks) = self.callbacks() else {
            return Dynamic::UNIT;
        };
        callbacks
            .receiver_get(&object.class, object.handle, property)
            .and_then(|handle| self.take(handle))
            .unwrap_or(Dynamic::UNIT)
    }

    fn receiver_set(&self, object: &ReceiverRef, property: &str, value: Dynamic) {
        let Some(callbacks) = self.callbacks() else {
            return;
        };
        match self.alloc(value) {
            Some(handle) => callbacks.receiver_set(&object.class, object.handle, property, handle),
            None => warn!(class = %object.class, property, "unable to allocate property value"),
        }
    }

    fn receiver_exists(&self, object: &ReceiverRef, property: &str) -> bool {
        self.callbacks()
            .map(|callbacks| callbacks.receiver_exists(&object.class, object.handle, property))
            .unwrap_or(false)
    }

    fn receiver_call(&self, object: &ReceiverRef, method: &str, args: Array) -> ScriptResult<Dynamic> {
        let callbacks = self
            .callbacks()
            .ok_or_else(|| script_error("engine is not running"))?;
        let args = self
            .alloc(Dynamic::from_array(args))
            .ok_or_else(|| script_error(format!("Unable to allocate arguments for '{method}'")))?;

        match callbacks.receiver_call(&object.class, object.handle, method, args) {
            Ok(Some(handle)) => Ok(self.take(handle).unwrap_or(Dynamic::UNIT)),
            Ok(None) => Ok(Dynamic::UNIT),
            Err(e) => Err(script_error(e.to_string())),
        }
    }
}

macro_rules! register_constructor {
    ($engine:expr, $shared:expr, $class:expr; $($arg:ident),*) => {{
        let shared = Arc::clone(&$shared);
        let class: ImmutableString = $class.clone();
        $engine.register_fn(
            $class.to_string(),
            move |$($arg: Dynamic),*| -> ScriptResult<ReceiverRef> {
                shared.construct(&class, vec![$($arg),*])
            },
        );
    }};
}

macro_rules! register_call {
    ($engine:expr, $shared:expr; $($arg:ident),*) => {{
        let shared = Arc::clone(&$shared);
        $engine.register_fn(
            "invoke",
            move |object: &mut ReceiverRef, method: ImmutableString $(, $arg: Dynamic)*| -> ScriptResult<Dynamic> {
                shared.receiver_call(object, &method, vec![$($arg),*])
            },
        );
    }};
}

/// Embedded rhai interpreter
pub struct RhaiRuntime {
    shared: Arc<Shared>,
    engine: RwLock<Option<Arc<Engine>>>,
    lifecycle: Mutex<Lifecycle>,
    classes: Mutex<Vec<ImmutableString>>,
    contexts: Mutex<HashMap<ContextHandle, Arc<Mutex<Scope<'static>>>>>,
    next_context: AtomicU64,
}

impl fmt::Debug for RhaiRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhaiRuntime")
            .field("lifecycle", &*self.lifecycle.lock())
            .field("classes", &*self.classes.lock())
            .field("contexts", &self.contexts.lock().len())
            .field("shared", &self.shared)
            .finish()
    }
}

impl Default for RhaiRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl RhaiRuntime {
    /// Create an interpreter that has not been started yet
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                arena: Mutex::new(HandleArena::with_capacity(config.max_handles)),
                callbacks: RwLock::new(None),
                next_object: AtomicU64::new(1),
                config,
            }),
            engine: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::Declaring),
            classes: Mutex::new(Vec::new()),
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Handle table counters
    pub fn stats(&self) -> ArenaStats {
        self.shared.arena.lock().stats()
    }

    /// Number of live execution scopes
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    fn build_engine(&self, classes: &[ImmutableString]) -> Engine {
        let config = &self.shared.config;
        let mut engine = Engine::new();

        engine.set_max_operations(config.max_operations);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);

        let shared = Arc::clone(&self.shared);
        engine.on_print(move |text| shared.write_output(format!("{text}\n").as_bytes()));

        let shared = Arc::clone(&self.shared);
        engine.on_debug(move |text, _source, _pos| shared.write_log(format!("{text}\n").as_bytes()));

        let shared = Arc::clone(&self.shared);
        engine.register_fn("echo", move |value: Dynamic| {
            shared.write_output(value.to_string().as_bytes())
        });

        let shared = Arc::clone(&self.shared);
        engine.register_fn("header", move |line: ImmutableString| {
            shared.set_header(HeaderOp::Replace, &line)
        });

        let shared = Arc::clone(&self.shared);
        engine.register_fn("header", move |line: ImmutableString, replace: bool| {
            let op = if replace {
                HeaderOp::Replace
            } else {
                HeaderOp::Append
            };
            shared.set_header(op, &line)
        });

        let shared = Arc::clone(&self.shared);
        engine.register_fn("header_remove", move |name: ImmutableString| {
            shared.set_header(HeaderOp::Delete, &name)
        });

        let shared = Arc::clone(&self.shared);
        engine.register_fn("read_input", move |max: INT| shared.read_input(max));

        engine
            .register_type_with_name::<StdObject>("object")
            .register_indexer_get(|object: &mut StdObject, name: ImmutableString| -> Dynamic {
                object
                    .properties
                    .get(name.as_str())
                    .cloned()
                    .unwrap_or(Dynamic::UNIT)
            })
            .register_indexer_set(|object: &mut StdObject, name: ImmutableString, value: Dynamic| {
                object.properties.insert(name.as_str().into(), value);
            });

        engine.register_type_with_name::<ReceiverRef>("receiver");

        let shared = Arc::clone(&self.shared);
        engine.register_indexer_get(move |object: &mut ReceiverRef, name: ImmutableString| -> Dynamic {
            shared.receiver_get(object, &name)
        });

        let shared = Arc::clone(&self.shared);
        engine.register_indexer_set(
            move |object: &mut ReceiverRef, name: ImmutableString, value: Dynamic| {
                shared.receiver_set(object, &name, value)
            },
        );

        let shared = Arc::clone(&self.shared);
        engine.register_fn("has", move |object: &mut ReceiverRef, name: ImmutableString| {
            shared.receiver_exists(object, &name)
        });

        register_call!(engine, self.shared;);
        register_call!(engine, self.shared; a);
        register_call!(engine, self.shared; a, b);
        register_call!(engine, self.shared; a, b, c);
        register_call!(engine, self.shared; a, b, c, d);
        register_call!(engine, self.shared; a, b, c, d, e);
        register_call!(engine, self.shared; a, b, c, d, e, f);

        for class in classes {
            register_constructor!(engine, self.shared, class;);
            register_constructor!(engine, self.shared, class; a);
            register_constructor!(engine, self.shared, class; a, b);
            register_constructor!(engine, self.shared, class; a, b, c);
            register_constructor!(engine, self.shared, class; a, b, c, d);
            register_constructor!(engine, self.shared, class; a, b, c, d, e);
            register_constructor!(engine, self.shared, class; a, b, c, d, e, f);
        }

        engine
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        self.engine
            .read()
            .clone()
            .ok_or_else(|| BridgeError::runtime("interpreter is not running"))
    }

    fn scope(&self, ctx: ContextHandle) -> Result<Arc<Mutex<Scope<'static>>>> {
        self.contexts
            .lock()
            .get(&ctx)
            .cloned()
            .ok_or_else(|| BridgeError::invalid_handle(format!("unknown context {}", ctx.0)))
    }

    /// Route a script error to the context sinks, then convert it.
    fn report(&self, err: Box<EvalAltResult>) -> BridgeError {
        let message = err.to_string();
        let config = &self.shared.config;

        if config.log_errors {
            self.shared.write_log(format!("{message}\n").as_bytes());
        }
        if config.display_errors {
            self.shared.write_output(format!("{message}\n").as_bytes());
        }

        BridgeError::Runtime(message)
    }

    fn insert(&self, target: RawHandle, key: EntryKey<'_>, value: RawHandle) -> Result<()> {
        let mut arena = self.shared.arena.lock();
        let child = arena
            .remove(value)
            .ok_or_else(|| BridgeError::invalid_handle(format!("unknown value {value}")))?;
        let slot = arena
            .get_mut(target)
            .ok_or_else(|| BridgeError::invalid_handle(format!("unknown container {target}")))?;

        insert_entry(&mut slot.value, key, child.value)
    }

    fn with_value<T>(&self, handle: RawHandle, default: T, f: impl FnOnce(&Dynamic) -> T) -> T {
        match self.shared.arena.lock().get(handle) {
            Some(slot) => f(&slot.value),
            None => default,
        }
    }
}

impl Runtime for RhaiRuntime {
    fn name(&self) -> &str {
        "rhai"
    }

    fn define_class(&self, name: &str) -> Result<()> {
        if *self.lifecycle.lock() != Lifecycle::Declaring {
            return Err(BridgeError::runtime(format!(
                "receiver '{name}' must be declared before the interpreter starts"
            )));
        }

        let mut classes = self.classes.lock();
        if classes.iter().any(|class| class.as_str() == name) {
            return Err(BridgeError::DuplicateReceiver(name.to_string()));
        }
        classes.push(name.into());

        debug!(class = name, "receiver class declared");
        Ok(())
    }

    fn startup(&self, callbacks: Arc<dyn Callbacks>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::Declaring {
            return Err(BridgeError::Initialization(format!(
                "interpreter cannot start from state {:?}",
                *lifecycle
            )));
        }

        let classes = self.classes.lock().clone();
        let engine = self.build_engine(&classes);

        *self.shared.callbacks.write() = Some(callbacks);
        *self.engine.write() = Some(Arc::new(engine));
        *lifecycle = Lifecycle::Running;

        debug!(classes = classes.len(), "rhai interpreter started");
        Ok(())
    }

    fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Stopped {
            return;
        }

        *self.shared.callbacks.write() = None;
        *self.engine.write() = None;
        *lifecycle = Lifecycle::Stopped;

        debug!("rhai interpreter stopped");
    }

    fn context_new(&self) -> Result<ContextHandle> {
        if *self.lifecycle.lock() != Lifecycle::Running {
            return Err(BridgeError::runtime("interpreter is not running"));
        }

        let ctx = ContextHandle(self.next_context.fetch_add(1, Ordering::Relaxed));
        self.contexts
            .lock()
            .insert(ctx, Arc::new(Mutex::new(Scope::new())));

        trace!(context = ctx.0, "scope created");
        Ok(ctx)
    }

    fn context_bind(&self, ctx: ContextHandle, name: &str, value: RawHandle) -> Result<()> {
        let value = self
            .shared
            .read(value)
            .ok_or_else(|| BridgeError::invalid_handle(format!("unknown value {value}")))?;
        let scope = self.scope(ctx)?;
        let mut scope = scope.lock();

        if scope.is_constant(name) == Some(true) {
            return Err(BridgeError::runtime(format!("'{name}' is a constant")));
        }
        scope.set_value(name.to_string(), value);

        Ok(())
    }

    fn context_exec(&self, ctx: ContextHandle, path: &Path) -> Result<()> {
        let engine = self.engine()?;
        let scope = self.scope(ctx)?;
        let code = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::runtime(format!("{}: {e}", path.display())))?;

        let _active = Activation::enter(ctx);
        let mut scope = scope.lock();
        engine
            .run_with_scope(&mut scope, &code)
            .map_err(|err| self.report(err))
    }

    fn context_eval(&self, ctx: ContextHandle, script: &str) -> Result<RawHandle> {
        let engine = self.engine()?;
        let scope = self.scope(ctx)?;

        let _active = Activation::enter(ctx);
        let mut scope = scope.lock();
        let mark = scope.len();
        let result = engine.eval_with_scope::<Dynamic>(&mut scope, script);
        scope.rewind(mark);

        let value = result.map_err(|err| self.report(err))?;
        self.shared
            .alloc(value)
            .ok_or_else(|| BridgeError::Allocation("evaluation result".to_string()))
    }

    fn context_destroy(&self, ctx: ContextHandle) {
        let scope = self.contexts.lock().remove(&ctx);
        if scope.is_some() {
            trace!(context = ctx.0, "scope destroyed");
        }
        drop(scope);
    }

    fn create_null(&self) -> Option<RawHandle> {
        self.shared.alloc(Dynamic::UNIT)
    }

    fn create_long(&self, value: i64) -> Option<RawHandle> {
        self.shared.alloc(Dynamic::from(value as INT))
    }

    fn create_double(&self, value: f64) -> Option<RawHandle> {
        self.shared.alloc(Dynamic::from(value as FLOAT))
    }

    fn create_bool(&self, value: bool) -> Option<RawHandle> {
        self.shared.alloc(Dynamic::from(value))
    }

    fn create_string(&self, value: &str) -> Option<RawHandle> {
        self.shared.alloc(Dynamic::from(ImmutableString::from(value)))
    }

    fn create_array(&self, size: usize) -> Option<RawHandle> {
        self.shared.alloc(Dynamic::from_array(Array::with_capacity(size)))
    }

    fn create_object(&self) -> Option<RawHandle> {
        self.shared.alloc(Dynamic::from(StdObject::default()))
    }

    fn array_push(&self, array: RawHandle, value: RawHandle) -> Result<()> {
        self.insert(array, EntryKey::Next, value)
    }

    fn array_insert_index(&self, array: RawHandle, index: i64, value: RawHandle) -> Result<()> {
        self.insert(array, EntryKey::Index(index), value)
    }

    fn array_insert_key(&self, array: RawHandle, key: &str, value: RawHandle) -> Result<()> {
        self.insert(array, EntryKey::Name(key), value)
    }

    fn object_set_property(&self, object: RawHandle, name: &str, value: RawHandle) -> Result<()> {
        let mut arena = self.shared.arena.lock();
        let child = arena
            .remove(value)
            .ok_or_else(|| BridgeError::invalid_handle(format!("unknown value {value}")))?;
        let slot = arena
            .get_mut(object)
            .ok_or_else(|| BridgeError::invalid_handle(format!("unknown object {object}")))?;
        let mut target = slot
            .value
            .write_lock::<StdObject>()
            .ok_or_else(|| BridgeError::runtime(format!("{object} is not an object")))?;

        target.properties.insert(name.into(), child.value);
        Ok(())
    }

    fn kind(&self, value: RawHandle) -> Option<Kind> {
        self.shared
            .arena
            .lock()
            .get(value)
            .map(|slot| kind_of(&slot.value))
    }

    fn get_long(&self, value: RawHandle) -> i64 {
        self.with_value(value, 0, to_long)
    }

    fn get_double(&self, value: RawHandle) -> f64 {
        self.with_value(value, 0.0, to_double)
    }

    fn get_bool(&self, value: RawHandle) -> bool {
        self.with_value(value, false, to_bool)
    }

    fn get_string(&self, value: RawHandle) -> String {
        self.with_value(value, String::new(), to_text)
    }

    fn array_size(&self, array: RawHandle) -> usize {
        self.with_value(array, 0, len_of)
    }

    fn array_keys(&self, array: RawHandle) -> Option<RawHandle> {
        let keys = self.with_value(array, None, |value| Some(keys_of(value)))?;
        self.shared.alloc(Dynamic::from_array(keys))
    }

    fn array_reset(&self, array: RawHandle) {
        if let Some(slot) = self.shared.arena.lock().get_mut(array) {
            slot.cursor = 0;
        }
    }

    fn array_next(&self, array: RawHandle) -> Option<RawHandle> {
        let mut arena = self.shared.arena.lock();
        let slot = arena.get_mut(array)?;
        let item = element_at(&slot.value, slot.cursor).unwrap_or(Dynamic::UNIT);
        slot.cursor += 1;

        arena.insert(Slot::new(item))
    }

    fn array_index(&self, array: RawHandle, index: i64) -> Option<RawHandle> {
        let item = self.with_value(array, None, |value| Some(element_by_index(value, index)))?;
        self.shared.alloc(item.unwrap_or(Dynamic::UNIT))
    }

    fn array_key(&self, array: RawHandle, key: &str) -> Option<RawHandle> {
        let item = self.with_value(array, None, |value| Some(element_by_key(value, key)))?;
        self.shared.alloc(item.unwrap_or(Dynamic::UNIT))
    }

    fn destroy(&self, value: RawHandle) {
        let slot = self.shared.arena.lock().remove(value);
        if slot.is_none() {
            trace!(handle = %value, "release of unknown handle ignored");
        }
        drop(slot);
    }
}

#[derive(Debug, Clone, Copy)]
enum EntryKey<'a> {
    Next,
    Index(i64),
    Name(&'a str),
}

fn insert_entry(target: &mut Dynamic, key: EntryKey<'_>, value: Dynamic) -> Result<()> {
    if let EntryKey::Next = key {
        if let Some(mut array) = target.write_lock::<Array>() {
            array.push(value);
            return Ok(());
        }
    }

    // Any keyed insert turns an indexed array associative.
    if target.is::<Array>() {
        let array = std::mem::replace(target, Dynamic::UNIT)
            .try_cast::<Array>()
            .unwrap_or_default();
        let map: Map = array
            .into_iter()
            .enumerate()
            .map(|(index, item)| (index.to_string().into(), item))
            .collect();
        *target = Dynamic::from_map(map);
    }

    if let Some(mut map) = target.write_lock::<Map>() {
        let key = match key {
            EntryKey::Next => map.len().to_string(),
            EntryKey::Index(index) => index.to_string(),
            EntryKey::Name(name) => name.to_string(),
        };
        map.insert(key.into(), value);
        return Ok(());
    }

    Err(BridgeError::runtime(format!(
        "cannot insert into value of type '{}'",
        target.type_name()
    )))
}

fn kind_of(value: &Dynamic) -> Kind {
    if value.is_unit() {
        Kind::Null
    } else if value.is::<INT>() {
        Kind::Long
    } else if value.is::<FLOAT>() {
        Kind::Double
    } else if value.is::<bool>() {
        Kind::Bool
    } else if value.is::<ImmutableString>() || value.is::<char>() {
        Kind::String
    } else if value.is::<Array>() {
        Kind::Array
    } else if value.is::<Map>() {
        Kind::Map
    } else {
        Kind::Object
    }
}

fn text_of(value: &Dynamic) -> Option<String> {
    if let Some(text) = value.read_lock::<ImmutableString>() {
        return Some(text.as_str().to_string());
    }
    value.as_char().ok().map(String::from)
}

/// Leading numeric portion of a string, `0` if there is none.
fn numeric_prefix(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        if bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            end = exp;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
    }

    text[..end].parse().unwrap_or(0.0)
}

fn to_long(value: &Dynamic) -> i64 {
    match kind_of(value) {
        Kind::Null => 0,
        Kind::Long => value.as_int().unwrap_or(0),
        Kind::Double => value.as_float().map(|f| f as i64).unwrap_or(0),
        Kind::Bool => value.as_bool().map(i64::from).unwrap_or(0),
        Kind::String => {
            let text = text_of(value).unwrap_or_default();
            text.trim()
                .parse::<i64>()
                .unwrap_or_else(|_| numeric_prefix(&text) as i64)
        }
        Kind::Array | Kind::Map | Kind::Object => i64::from(len_of(value) > 0),
    }
}

fn to_double(value: &Dynamic) -> f64 {
    match kind_of(value) {
        Kind::Null => 0.0,
        Kind::Long => value.as_int().map(|i| i as f64).unwrap_or(0.0),
        Kind::Double => value.as_float().unwrap_or(0.0),
        Kind::Bool => value.as_bool().map(|b| if b { 1.0 } else { 0.0 }).unwrap_or(0.0),
        Kind::String => numeric_prefix(&text_of(value).unwrap_or_default()),
        Kind::Array | Kind::Map | Kind::Object => {
            if len_of(value) > 0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn to_bool(value: &Dynamic) -> bool {
    match kind_of(value) {
        Kind::Null => false,
        Kind::Long => value.as_int().map(|i| i != 0).unwrap_or(false),
        Kind::Double => value.as_float().map(|f| f != 0.0).unwrap_or(false),
        Kind::Bool => value.as_bool().unwrap_or(false),
        Kind::String => {
            let text = text_of(value).unwrap_or_default();
            !(text.is_empty() || text == "0")
        }
        Kind::Array | Kind::Map => len_of(value) > 0,
        Kind::Object => true,
    }
}

fn to_text(value: &Dynamic) -> String {
    match kind_of(value) {
        Kind::Null | Kind::Object => String::new(),
        Kind::Long => value.as_int().map(|i| i.to_string()).unwrap_or_default(),
        Kind::Double => value.as_float().map(|f| f.to_string()).unwrap_or_default(),
        Kind::Bool => {
            if value.as_bool().unwrap_or(false) {
                "1".to_string()
            } else {
                String::new()
            }
        }
        Kind::String => text_of(value).unwrap_or_default(),
        Kind::Array | Kind::Map => "Array".to_string(),
    }
}

fn len_of(value: &Dynamic) -> usize {
    if value.is_unit() || value.is::<ReceiverRef>() {
        0
    } else if let Some(array) = value.read_lock::<Array>() {
        array.len()
    } else if let Some(map) = value.read_lock::<Map>() {
        map.len()
    } else if let Some(object) = value.read_lock::<StdObject>() {
        object.properties.len()
    } else {
        1
    }
}

fn keys_of(value: &Dynamic) -> Array {
    if value.is_unit() || value.is::<ReceiverRef>() {
        Array::new()
    } else if let Some(array) = value.read_lock::<Array>() {
        (0..array.len()).map(|index| Dynamic::from(index as INT)).collect()
    } else if let Some(map) = value.read_lock::<Map>() {
        map.keys()
            .map(|key| Dynamic::from(ImmutableString::from(key.as_str())))
            .collect()
    } else if let Some(object) = value.read_lock::<StdObject>() {
        object
            .properties
            .keys()
            .map(|key| Dynamic::from(ImmutableString::from(key.as_str())))
            .collect()
    } else {
        vec![Dynamic::from(0 as INT)]
    }
}

fn element_at(value: &Dynamic, position: usize) -> Option<Dynamic> {
    if value.is_unit() || value.is::<ReceiverRef>() {
        None
    } else if let Some(array) = value.read_lock::<Array>() {
        array.get(position).cloned()
    } else if let Some(map) = value.read_lock::<Map>() {
        map.values().nth(position).cloned()
    } else if let Some(object) = value.read_lock::<StdObject>() {
        object.properties.values().nth(position).cloned()
    } else {
        // Scalars read as a single-element array of themselves.
        Some(value.clone())
    }
}

fn element_by_index(value: &Dynamic, index: i64) -> Option<Dynamic> {
    if value.is_unit() || value.is::<ReceiverRef>() {
        None
    } else if let Some(array) = value.read_lock::<Array>() {
        usize::try_from(index)
            .ok()
            .and_then(|index| array.get(index).cloned())
    } else if let Some(map) = value.read_lock::<Map>() {
        map.get(index.to_string().as_str()).cloned()
    } else if let Some(object) = value.read_lock::<StdObject>() {
        object.properties.get(index.to_string().as_str()).cloned()
    } else if index == 0 {
        Some(value.clone())
    } else {
        None
    }
}

fn element_by_key(value: &Dynamic, key: &str) -> Option<Dynamic> {
    if let Some(map) = value.read_lock::<Map>() {
        map.get(key).cloned()
    } else if let Some(object) = value.read_lock::<StdObject>() {
        object.properties.get(key).cloned()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::io;

    #[derive(Default)]
    struct Recorder {
        output: Mutex<Vec<u8>>,
        log: Mutex<Vec<u8>>,
        headers: Mutex<Vec<(HeaderOp, String)>>,
    }

    impl Callbacks for Recorder {
        fn write_output(&self, _ctx: ContextHandle, bytes: &[u8]) -> io::Result<usize> {
            self.output.lock().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn write_log(&self, _ctx: ContextHandle, bytes: &[u8]) -> io::Result<usize> {
            self.log.lock().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn read_input(&self, _ctx: ContextHandle, buf: &mut [u8]) -> io::Result<usize> {
            let input = b"payload";
            let n = input.len().min(buf.len());
            buf[..n].copy_from_slice(&input[..n]);
            Ok(n)
        }

        fn set_header(&self, _ctx: ContextHandle, op: HeaderOp, line: &str) {
            self.headers.lock().push((op, line.to_string()));
        }

        fn receiver_construct(&self, _: &str, _: ObjectHandle, _: RawHandle) -> bool {
            false
        }

        fn receiver_destroy(&self, _: &str, _: ObjectHandle) {}

        fn receiver_get(&self, _: &str, _: ObjectHandle, _: &str) -> Option<RawHandle> {
            None
        }

        fn receiver_set(&self, _: &str, _: ObjectHandle, _: &str, _: RawHandle) {}

        fn receiver_exists(&self, _: &str, _: ObjectHandle, _: &str) -> bool {
            false
        }

        fn receiver_call(
            &self,
            _: &str,
            _: ObjectHandle,
            _: &str,
            _: RawHandle,
        ) -> Result<Option<RawHandle>> {
            Ok(None)
        }
    }

    fn started() -> (RhaiRuntime, Arc<Recorder>) {
        let runtime = RhaiRuntime::default();
        let recorder = Arc::new(Recorder::default());
        runtime.startup(recorder.clone()).unwrap();
        (runtime, recorder)
    }

    #[test]
    fn test_scalar_kinds_and_coercions() {
        let runtime = RhaiRuntime::default();

        let number = runtime.create_string("12abc").unwrap();
        assert_eq!(runtime.kind(number), Some(Kind::String));
        assert_eq!(runtime.get_long(number), 12);
        assert!(runtime.get_bool(number));

        let zero = runtime.create_string("0").unwrap();
        assert!(!runtime.get_bool(zero));

        let flag = runtime.create_bool(true).unwrap();
        assert_eq!(runtime.get_long(flag), 1);
        assert_eq!(runtime.get_string(flag), "1");

        let float = runtime.create_double(2.5).unwrap();
        assert_eq!(runtime.get_long(float), 2);
        assert_eq!(runtime.get_string(float), "2.5");

        for handle in [number, zero, flag, float] {
            runtime.destroy(handle);
        }
        assert_eq!(runtime.stats().live, 0);
    }

    #[test]
    fn test_numeric_prefix() {
        assert_eq!(numeric_prefix("  3.5kg"), 3.5);
        assert_eq!(numeric_prefix("-2e3x"), -2000.0);
        assert_eq!(numeric_prefix("1e"), 1.0);
        assert_eq!(numeric_prefix("abc"), 0.0);
    }

    #[test]
    fn test_named_key_promotes_array_to_map() {
        let runtime = RhaiRuntime::default();
        let array = runtime.create_array(2).unwrap();

        let first = runtime.create_long(1).unwrap();
        runtime.array_push(array, first).unwrap();
        assert_eq!(runtime.kind(array), Some(Kind::Array));

        let second = runtime.create_long(2).unwrap();
        runtime.array_insert_key(array, "two", second).unwrap();
        assert_eq!(runtime.kind(array), Some(Kind::Map));
        assert_eq!(runtime.array_size(array), 2);

        let value = runtime.array_key(array, "two").unwrap();
        assert_eq!(runtime.get_long(value), 2);
        let value_zero = runtime.array_index(array, 0).unwrap();
        assert_eq!(runtime.get_long(value_zero), 1);

        runtime.destroy(value);
        runtime.destroy(value_zero);
        runtime.destroy(array);
        assert_eq!(runtime.stats().live, 0);
        assert_eq!(runtime.stats().rejected, 0);
    }

    #[test]
    fn test_index_insert_makes_array_associative() {
        let runtime = RhaiRuntime::default();
        let array = runtime.create_array(2).unwrap();

        let pushed = runtime.create_long(1).unwrap();
        runtime.array_push(array, pushed).unwrap();
        assert_eq!(runtime.kind(array), Some(Kind::Array));

        let indexed = runtime.create_long(2).unwrap();
        runtime.array_insert_index(array, 1, indexed).unwrap();
        assert_eq!(runtime.kind(array), Some(Kind::Map));

        let keys = runtime.array_keys(array).unwrap();
        let first = runtime.array_index(keys, 0).unwrap();
        let second = runtime.array_index(keys, 1).unwrap();
        assert_eq!(runtime.get_string(first), "0");
        assert_eq!(runtime.get_string(second), "1");

        for handle in [first, second, keys, array] {
            runtime.destroy(handle);
        }
        assert_eq!(runtime.stats().live, 0);
    }

    #[test]
    fn test_scalar_reads_as_single_element() {
        let runtime = RhaiRuntime::default();
        let scalar = runtime.create_long(9).unwrap();

        assert_eq!(runtime.array_size(scalar), 1);
        runtime.array_reset(scalar);
        let item = runtime.array_next(scalar).unwrap();
        assert_eq!(runtime.get_long(item), 9);

        let null = runtime.create_null().unwrap();
        assert_eq!(runtime.array_size(null), 0);

        for handle in [scalar, item, null] {
            runtime.destroy(handle);
        }
    }

    #[test]
    fn test_next_past_end_yields_null() {
        let runtime = RhaiRuntime::default();
        let array = runtime.create_array(0).unwrap();

        let item = runtime.array_next(array).unwrap();
        assert_eq!(runtime.kind(item), Some(Kind::Null));

        runtime.destroy(item);
        runtime.destroy(array);
    }

    #[test]
    fn test_object_properties() {
        let runtime = RhaiRuntime::default();
        let object = runtime.create_object().unwrap();
        let name = runtime.create_string("ada").unwrap();
        runtime.object_set_property(object, "name", name).unwrap();

        assert_eq!(runtime.kind(object), Some(Kind::Object));
        assert_eq!(runtime.array_size(object), 1);

        let array = runtime.create_array(0).unwrap();
        let value = runtime.create_long(1).unwrap();
        assert!(runtime.object_set_property(array, "x", value).is_err());
        assert_eq!(runtime.kind(value), None);

        runtime.destroy(array);
        runtime.destroy(object);
        assert_eq!(runtime.stats().live, 0);
        assert_eq!(runtime.stats().rejected, 0);
    }

    #[test]
    fn test_allocation_refused_when_full() {
        let runtime = RhaiRuntime::new(RuntimeConfig {
            max_handles: 1,
            ..RuntimeConfig::default()
        });
        let first = runtime.create_long(1).unwrap();

        assert!(runtime.create_long(2).is_none());
        assert_eq!(runtime.stats().refused, 1);

        runtime.destroy(first);
    }

    #[test]
    fn test_classes_must_be_declared_before_startup() {
        let runtime = RhaiRuntime::default();
        runtime.define_class("Counter").unwrap();
        assert!(matches!(
            runtime.define_class("Counter"),
            Err(BridgeError::DuplicateReceiver(_))
        ));

        runtime.startup(Arc::new(Recorder::default())).unwrap();
        assert!(runtime.define_class("Late").is_err());
    }

    #[test]
    fn test_restart_after_shutdown_fails() {
        let (runtime, _recorder) = started();
        runtime.shutdown();

        assert!(runtime.context_new().is_err());
        assert!(runtime.startup(Arc::new(Recorder::default())).is_err());
    }

    #[test]
    fn test_eval_output_and_headers() {
        let (runtime, recorder) = started();
        let ctx = runtime.context_new().unwrap();

        let result = runtime
            .context_eval(
                ctx,
                r#"print("hello"); echo(42); header("X-A: 1"); header("X-A: 2", false); header_remove("X-B"); 40 + 2"#,
            )
            .unwrap();
        assert_eq!(runtime.get_long(result), 42);
        assert_eq!(&*recorder.output.lock(), b"hello\n42");
        assert_eq!(
            *recorder.headers.lock(),
            vec![
                (HeaderOp::Replace, "X-A: 1".to_string()),
                (HeaderOp::Append, "X-A: 2".to_string()),
                (HeaderOp::Delete, "X-B".to_string()),
            ]
        );

        runtime.destroy(result);
        runtime.context_destroy(ctx);
    }

    #[test]
    fn test_eval_discards_declared_variables() {
        let (runtime, _recorder) = started();
        let ctx = runtime.context_new().unwrap();

        let bound = runtime.create_long(5).unwrap();
        runtime.context_bind(ctx, "x", bound).unwrap();

        let result = runtime.context_eval(ctx, "let y = x * 2; y").unwrap();
        assert_eq!(runtime.get_long(result), 10);
        assert!(runtime.context_eval(ctx, "y").is_err());

        let still_bound = runtime.context_eval(ctx, "x").unwrap();
        assert_eq!(runtime.get_long(still_bound), 5);

        for handle in [bound, result, still_bound] {
            runtime.destroy(handle);
        }
        runtime.context_destroy(ctx);
    }

    #[test]
    fn test_script_errors_reach_log_sink() {
        let (runtime, recorder) = started();
        let ctx = runtime.context_new().unwrap();

        assert!(runtime.context_eval(ctx, "throw \"broken\"").is_err());
        let log = String::from_utf8(recorder.log.lock().clone()).unwrap();
        assert!(log.contains("broken"));
        assert!(recorder.output.lock().is_empty());

        runtime.context_destroy(ctx);
    }

    #[test]
    fn test_read_input() {
        let (runtime, _recorder) = started();
        let ctx = runtime.context_new().unwrap();

        let result = runtime.context_eval(ctx, "read_input(3)").unwrap();
        assert_eq!(runtime.get_string(result), "pay");

        runtime.destroy(result);
        runtime.context_destroy(ctx);
    }

    #[test]
    fn test_failed_construct_raises_script_error() {
        let runtime = RhaiRuntime::default();
        runtime.define_class("Broken").unwrap();
        runtime.startup(Arc::new(Recorder::default())).unwrap();
        let ctx = runtime.context_new().unwrap();

        let err = runtime.context_eval(ctx, "Broken(1, 2)").unwrap_err();
        assert!(err.to_string().contains("Failed to instantiate"));

        runtime.context_destroy(ctx);
    }

    #[test]
    fn test_double_destroy_is_counted_not_fatal() {
        let runtime = RhaiRuntime::default();
        let value = runtime.create_long(1).unwrap();
        runtime.destroy(value);
        runtime.destroy(value);

        assert_eq!(runtime.stats().rejected, 1);
    }
}
