//! Live configuration objects.
//!
//! A [`Configuration`] is shared between the store, the manager and queued
//! delivery tasks. All mutable fields sit behind one per-object lock so a
//! [`ConfigurationSnapshot`] always pairs properties with the revision they
//! were written under.

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConfigAdminError, Result};
use crate::properties::{
    Properties, CONFIGURATION_REVISION, SERVICE_BUNDLELOCATION, SERVICE_FACTORYPID, SERVICE_PID,
};

const SYNTHETIC_KEYS: &[&str] = &[
    SERVICE_PID,
    SERVICE_FACTORYPID,
    SERVICE_BUNDLELOCATION,
    CONFIGURATION_REVISION,
];

#[derive(Debug, Default)]
struct ConfigurationState {
    /// User properties. `None` until the first update.
    properties: Option<Properties>,
    static_location: Option<String>,
    dynamic_location: Option<String>,
    revision: u64,
    deleted: bool,
}

/// A named, versioned configuration dictionary.
#[derive(Debug)]
pub struct Configuration {
    pid: String,
    factory_pid: Option<String>,
    /// Distinguishes a recreated configuration from a deleted one with the
    /// same PID.
    instance: Uuid,
    state: Mutex<ConfigurationState>,
}

/// Frozen view of a configuration at one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationSnapshot {
    pub pid: String,
    pub factory_pid: Option<String>,
    /// Properties as delivered to targets, `None` for a new configuration.
    pub properties: Option<Properties>,
    pub revision: u64,
    /// Effective owner location at snapshot time.
    pub location: Option<String>,
    pub instance: Uuid,
}

/// An update that has been staged but not yet applied. Built by
/// [`Configuration::prepare_update`] so the durable dictionary can be
/// written before the live object changes.
#[derive(Debug, Clone)]
pub(crate) struct PreparedUpdate {
    properties: Properties,
    revision: u64,
    persisted: Properties,
}

impl PreparedUpdate {
    pub(crate) fn persisted(&self) -> &Properties {
        &self.persisted
    }
}

impl Configuration {
    pub(crate) fn new(
        pid: impl Into<String>,
        factory_pid: Option<String>,
        static_location: Option<String>,
    ) -> Self {
        Self {
            pid: pid.into(),
            factory_pid,
            instance: Uuid::new_v4(),
            state: Mutex::new(ConfigurationState {
                static_location,
                ..Default::default()
            }),
        }
    }

    /// Rebuild a configuration from its durable dictionary. Returns `None`
    /// when the dictionary carries no PID.
    pub(crate) fn from_persisted(dict: &Properties) -> Option<Self> {
        let pid = dict.get_str(SERVICE_PID)?.to_string();
        let factory_pid = dict.get_str(SERVICE_FACTORYPID).map(str::to_string);
        let static_location = dict.get_str(SERVICE_BUNDLELOCATION).map(str::to_string);
        let revision = dict
            .get(CONFIGURATION_REVISION)
            .and_then(Value::as_u64)
            .unwrap_or(1);

        Some(Self {
            pid,
            factory_pid,
            instance: Uuid::new_v4(),
            state: Mutex::new(ConfigurationState {
                properties: Some(dict.without_keys(SYNTHETIC_KEYS)),
                static_location,
                dynamic_location: None,
                revision,
                deleted: false,
            }),
        })
    }

    /// Durable dictionary: user properties plus the synthetic keys.
    pub(crate) fn to_persisted(&self) -> Properties {
        let state = self.state.lock();
        self.persisted_dict(
            state.properties.clone().unwrap_or_default(),
            state.static_location.as_deref(),
            state.revision,
        )
    }

    fn persisted_dict(
        &self,
        mut dict: Properties,
        static_location: Option<&str>,
        revision: u64,
    ) -> Properties {
        dict.insert(SERVICE_PID, self.pid.clone());
        if let Some(factory_pid) = &self.factory_pid {
            dict.insert(SERVICE_FACTORYPID, factory_pid.clone());
        }
        if let Some(location) = static_location {
            dict.insert(SERVICE_BUNDLELOCATION, location);
        }
        dict.insert(CONFIGURATION_REVISION, revision);
        dict
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn factory_pid(&self) -> Option<&str> {
        self.factory_pid.as_deref()
    }

    /// Properties including `service.pid` (and `service.factoryPid` for
    /// factory instances), or `None` while the configuration is new.
    pub fn properties(&self) -> Option<Properties> {
        let state = self.state.lock();
        self.delivered_properties(&state)
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Effective owner: the explicit binding if set, else the dynamic one.
    pub fn bundle_location(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .static_location
            .clone()
            .or_else(|| state.dynamic_location.clone())
    }

    pub fn static_location(&self) -> Option<String> {
        self.state.lock().static_location.clone()
    }

    pub fn dynamic_location(&self) -> Option<String> {
        self.state.lock().dynamic_location.clone()
    }

    pub fn is_new(&self) -> bool {
        self.state.lock().properties.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn snapshot(&self) -> ConfigurationSnapshot {
        let state = self.state.lock();
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &ConfigurationState) -> ConfigurationSnapshot {
        ConfigurationSnapshot {
            pid: self.pid.clone(),
            factory_pid: self.factory_pid.clone(),
            properties: self.delivered_properties(state),
            revision: state.revision,
            location: state
                .static_location
                .clone()
                .or_else(|| state.dynamic_location.clone()),
            instance: self.instance,
        }
    }

    fn delivered_properties(&self, state: &ConfigurationState) -> Option<Properties> {
        let mut props = state.properties.clone()?;
        props.insert(SERVICE_PID, self.pid.clone());
        if let Some(factory_pid) = &self.factory_pid {
            props.insert(SERVICE_FACTORYPID, factory_pid.clone());
        }
        Some(props)
    }

    /// Stage an update: the stripped properties, the next revision and the
    /// durable dictionary they produce. The configuration is unchanged.
    pub(crate) fn prepare_update(&self, properties: Properties) -> Result<PreparedUpdate> {
        let state = self.state.lock();
        if state.deleted {
            return Err(ConfigAdminError::Deleted(self.pid.clone()));
        }
        let properties = properties.without_keys(SYNTHETIC_KEYS);
        let revision = state.revision + 1;
        let persisted = self.persisted_dict(
            properties.clone(),
            state.static_location.as_deref(),
            revision,
        );
        Ok(PreparedUpdate {
            properties,
            revision,
            persisted,
        })
    }

    /// Apply a staged update once it has been stored. The revision never
    /// moves backwards if another update committed in between.
    pub(crate) fn commit_update(&self, prepared: PreparedUpdate) -> Result<ConfigurationSnapshot> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(ConfigAdminError::Deleted(self.pid.clone()));
        }
        state.properties = Some(prepared.properties);
        state.revision = prepared.revision.max(state.revision + 1);
        Ok(self.snapshot_of(&state))
    }

    /// Replace the user properties and bump the revision.
    #[cfg(test)]
    pub(crate) fn apply_update(&self, properties: Properties) -> Result<ConfigurationSnapshot> {
        let prepared = self.prepare_update(properties)?;
        self.commit_update(prepared)
    }

    /// Explicit binding. Clears any dynamic binding and bumps the revision.
    /// Returns the previous effective location and whether a dynamic
    /// binding was dropped.
    pub(crate) fn set_static_location(
        &self,
        location: Option<String>,
    ) -> Result<(Option<String>, bool)> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(ConfigAdminError::Deleted(self.pid.clone()));
        }
        let old = state
            .static_location
            .clone()
            .or_else(|| state.dynamic_location.clone());
        let had_dynamic = state.dynamic_location.take().is_some();
        state.static_location = location;
        state.revision += 1;
        Ok((old, had_dynamic))
    }

    /// Bind dynamically if no owner is set yet.
    pub(crate) fn try_bind_dynamic(&self, location: &str) -> bool {
        let mut state = self.state.lock();
        if state.deleted || state.static_location.is_some() || state.dynamic_location.is_some() {
            return false;
        }
        state.dynamic_location = Some(location.to_string());
        true
    }

    /// Drop the dynamic binding if it points at `location`.
    pub(crate) fn clear_dynamic(&self, location: &str) -> bool {
        let mut state = self.state.lock();
        if state.dynamic_location.as_deref() == Some(location) {
            state.dynamic_location = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn restore_dynamic(&self, location: Option<String>) {
        self.state.lock().dynamic_location = location;
    }

    /// Mark deleted. Returns `false` if it already was.
    pub(crate) fn mark_deleted(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.deleted, true)
    }
}
