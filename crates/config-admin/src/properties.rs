//! Case-insensitive configuration dictionaries.
//!
//! Keys keep the spelling they were first inserted with, but lookups,
//! replacement and removal ignore ASCII case. Iteration is ordered by the
//! folded key so two dictionaries with the same content always iterate the
//! same way.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Synthetic property carrying the configuration PID.
pub const SERVICE_PID: &str = "service.pid";

/// Synthetic property carrying the factory PID of a factory instance.
pub const SERVICE_FACTORYPID: &str = "service.factoryPid";

/// Persisted explicit owner location.
pub const SERVICE_BUNDLELOCATION: &str = "service.bundleLocation";

/// Persisted revision counter.
pub const CONFIGURATION_REVISION: &str = "config.admin.revision";

/// Ordered, case-insensitive string → value mapping.
#[derive(Clone, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<String, (String, Value)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value stored under any
    /// spelling of the key. The new spelling replaces the old one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        self.entries
            .insert(key.to_ascii_lowercase(), (key, value.into()))
            .map(|(_, old)| old)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&key.to_ascii_lowercase()).map(|(_, v)| v)
    }

    /// String view of a value, if it is a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries
            .remove(&key.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(key, value)` pairs using the stored key spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(k, _)| k.as_str())
    }

    /// Copy without the synthetic keys that only matter to the durable store.
    pub(crate) fn without_keys(&self, keys: &[&str]) -> Properties {
        let mut out = self.clone();
        for key in keys {
            out.remove(key);
        }
        out
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        props.extend(iter);
        props
    }
}

impl<K, V> Extend<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<Value>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PropertiesVisitor;

        impl<'de> Visitor<'de> for PropertiesVisitor {
            type Value = Properties;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of configuration properties")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Properties, A::Error> {
                let mut props = Properties::new();
                while let Some((k, v)) = access.next_entry::<String, Value>()? {
                    props.insert(k, v);
                }
                Ok(props)
            }
        }

        deserializer.deserialize_map(PropertiesVisitor)
    }
}
