//! Targeted PIDs.
//!
//! A configuration PID may narrow the targets it applies to by appending
//! `|symbolic-name`, `|version` and `|location` to the service PID. A target
//! asking for `svc.Foo` is offered the most specific existing configuration.

use std::fmt;

use semver::Version;

/// Identity attributes of a target, used to resolve targeted PIDs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetIdentity {
    pub symbolic_name: Option<String>,
    pub version: Option<Version>,
    pub location: Option<String>,
}

impl TargetIdentity {
    pub fn new(symbolic_name: impl Into<String>, version: Version, location: impl Into<String>) -> Self {
        Self {
            symbolic_name: Some(symbolic_name.into()),
            version: Some(version),
            location: Some(location.into()),
        }
    }

    /// Identity with only a location, which matches untargeted PIDs.
    pub fn at_location(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Default::default()
        }
    }
}

/// A PID split into its service PID and targeting components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedPid {
    raw: String,
    service_pid: String,
    symbolic_name: Option<String>,
    version: Option<String>,
    location: Option<String>,
}

impl TargetedPid {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(4, '|');
        let service_pid = parts.next().unwrap_or_default().to_string();
        let mut next = || parts.next().map(str::to_string);
        let symbolic_name = next();
        let version = next();
        let location = next();
        Self {
            raw: raw.to_string(),
            service_pid,
            symbolic_name,
            version,
            location,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn service_pid(&self) -> &str {
        &self.service_pid
    }

    /// Number of targeting components, 0 for a plain PID.
    pub fn binding_level(&self) -> usize {
        [&self.symbolic_name, &self.version, &self.location]
            .iter()
            .filter(|c| c.is_some())
            .count()
    }

    /// True if this PID narrows more tightly than `other`.
    pub fn binds_stronger(&self, other: &TargetedPid) -> bool {
        self.binding_level() > other.binding_level()
    }

    /// Check every targeting component against the target identity.
    pub fn matches_target(&self, identity: &TargetIdentity) -> bool {
        if let Some(name) = &self.symbolic_name {
            if identity.symbolic_name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(version) = &self.version {
            match &identity.version {
                Some(v) if v.to_string() == *version => {}
                _ => return false,
            }
        }
        if let Some(location) = &self.location {
            if identity.location.as_deref() != Some(location.as_str()) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for TargetedPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Service PID part of a possibly targeted PID.
pub fn service_pid(raw: &str) -> &str {
    raw.split('|').next().unwrap_or(raw)
}

/// Candidate PIDs for `raw`, most specific first. Forms that need an
/// identity component the target lacks are left out.
pub fn candidates(raw: &str, identity: &TargetIdentity) -> Vec<String> {
    let mut out = Vec::with_capacity(4);
    if let Some(name) = &identity.symbolic_name {
        if let Some(version) = &identity.version {
            if let Some(location) = &identity.location {
                out.push(format!("{}|{}|{}|{}", raw, name, version, location));
            }
            out.push(format!("{}|{}|{}", raw, name, version));
        }
        out.push(format!("{}|{}", raw, name));
    }
    out.push(raw.to_string());
    out
}
