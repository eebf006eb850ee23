//! Helpers for testing code that drives the bridge

use crate::error::{BridgeError, Result};
use crate::receiver::{Object, Receiver};
use crate::value::HostValue;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

/// In-memory sink that can be handed to a context and inspected afterwards
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Bytes written so far, lossily decoded
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }

    /// Discard everything written so far
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Object holding arbitrary properties.
///
/// Constructor arguments become properties `arg0`, `arg1`, ... Methods:
/// `keys()`, `get(name)`, `set(name, value)` and `fail(message)`, which
/// always errors.
#[derive(Debug, Clone, Default)]
pub struct PropertyBag {
    properties: BTreeMap<String, HostValue>,
}

impl PropertyBag {
    /// Receiver constructing property bags under `name`
    pub fn receiver(name: &str) -> Receiver {
        Receiver::new(name, |args| {
            let properties = args
                .iter()
                .enumerate()
                .map(|(i, value)| (format!("arg{i}"), value.clone()))
                .collect();
            Ok(Box::new(PropertyBag { properties }) as Box<dyn Object>)
        })
    }
}

impl Object for PropertyBag {
    fn get(&self, property: &str) -> Result<HostValue> {
        self.properties
            .get(property)
            .cloned()
            .ok_or_else(|| BridgeError::runtime(format!("no property '{property}'")))
    }

    fn set(&mut self, property: &str, value: HostValue) {
        self.properties.insert(property.to_string(), value);
    }

    fn exists(&self, property: &str) -> bool {
        self.properties.contains_key(property)
    }

    fn call(&mut self, method: &str, args: Vec<HostValue>) -> Result<Option<HostValue>> {
        let mut args = args.into_iter();
        match method {
            "keys" => Ok(Some(HostValue::List(
                self.properties.keys().map(|k| HostValue::from(k.as_str())).collect(),
            ))),
            "get" => {
                let name = args.next().unwrap_or_default();
                Ok(name
                    .as_str()
                    .and_then(|name| self.properties.get(name))
                    .cloned())
            }
            "set" => {
                let name = args.next().unwrap_or_default();
                let value = args.next().unwrap_or_default();
                match name {
                    HostValue::Text(name) => {
                        self.properties.insert(name, value);
                        Ok(None)
                    }
                    other => Err(BridgeError::runtime(format!(
                        "property name must be text, got {}",
                        other.type_name()
                    ))),
                }
            }
            "fail" => Err(BridgeError::runtime(
                args.next()
                    .and_then(|m| m.as_str().map(str::to_string))
                    .unwrap_or_else(|| "failure requested".to_string()),
            )),
            other => Err(BridgeError::runtime(format!("no method '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_buffer_collects_writes() {
        let buffer = SharedBuffer::new();
        let mut writer = buffer.clone();
        write!(writer, "a{}", 1).unwrap();

        assert_eq!(buffer.contents(), "a1");
        buffer.clear();
        assert!(buffer.bytes().is_empty());
    }

    #[test]
    fn test_property_bag_methods() {
        let mut bag = PropertyBag::default();
        bag.call("set", vec!["name".into(), "ada".into()]).unwrap();

        assert_eq!(bag.get("name").unwrap(), HostValue::from("ada"));
        assert_eq!(
            bag.call("keys", vec![]).unwrap(),
            Some(HostValue::List(vec!["name".into()]))
        );
        assert!(bag.call("fail", vec!["boom".into()]).is_err());
        assert!(bag.get("missing").is_err());
    }
}
