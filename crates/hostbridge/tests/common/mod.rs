//! Shared fixtures for integration tests

#![allow(dead_code)]

use hostbridge::prelude::*;
use hostbridge::RhaiRuntime;
use hostbridge_config::RuntimeConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static LOCK: Mutex<()> = Mutex::new(());

/// The engine is a process singleton; tests that start one run one at a time.
pub fn serial() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Start an engine on a runtime the test keeps a handle to, for its counters.
pub fn start(receivers: Vec<Receiver>) -> (Engine, Arc<RhaiRuntime>) {
    start_with(receivers, RuntimeConfig::default())
}

pub fn start_with(receivers: Vec<Receiver>, config: RuntimeConfig) -> (Engine, Arc<RhaiRuntime>) {
    let runtime = Arc::new(RhaiRuntime::new(config));
    let engine = Engine::start_with_runtime(runtime.clone(), receivers).unwrap();
    (engine, runtime)
}

/// Counter exposed to scripts; `live` tracks instances not yet dropped.
pub struct Counter {
    count: i64,
    live: Arc<AtomicUsize>,
}

impl Drop for Counter {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Object for Counter {
    fn get(&self, property: &str) -> Result<HostValue> {
        match property {
            "count" => Ok(HostValue::Int(self.count)),
            other => Err(BridgeError::runtime(format!("no property {other}"))),
        }
    }

    fn set(&mut self, property: &str, value: HostValue) {
        if property == "count" {
            self.count = value.as_int().unwrap_or_default();
        }
    }

    fn exists(&self, property: &str) -> bool {
        property == "count"
    }

    fn call(&mut self, method: &str, args: Vec<HostValue>) -> Result<Option<HostValue>> {
        match method {
            "increment" => {
                self.count += 1;
                Ok(Some(HostValue::Int(self.count)))
            }
            "add" => {
                self.count += args.iter().filter_map(HostValue::as_int).sum::<i64>();
                Ok(Some(HostValue::Int(self.count)))
            }
            "reset" => {
                self.count = 0;
                Ok(None)
            }
            other => Err(BridgeError::runtime(format!("Counter has no method '{other}'"))),
        }
    }
}

/// Receiver for [`Counter`]; the first constructor argument is the start value.
pub fn counter_receiver(live: Arc<AtomicUsize>) -> Receiver {
    Receiver::new("Counter", move |args| {
        let count = match args.first() {
            None => 0,
            Some(HostValue::Int(start)) => *start,
            Some(other) => {
                return Err(BridgeError::runtime(format!(
                    "Counter expects an int, got {}",
                    other.type_name()
                )))
            }
        };
        live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Counter {
            count,
            live: live.clone(),
        }) as Box<dyn Object>)
    })
}
