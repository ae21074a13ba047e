//! The four-level bypass plane. Levels compose: a system bypass implies no
//! DDL anywhere; a component bypass turns one subsystem off; a feature
//! bypass disables a single named behavior inside a component; startup
//! bypass boots the daemon inert, with initialization done but no scheduler
//! ticks.
use std::collections::BTreeSet;

use parking_lot::RwLock;
use serde_json::json;

pub const COMPONENT_DECISION: &str = "decision-engine";
pub const COMPONENT_EXECUTOR: &str = "executor";
pub const COMPONENT_MAINTENANCE: &str = "maintenance";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BypassLevel {
    Feature,
    Component,
    System,
    Startup,
}

impl BypassLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "feature" | "l1" => Some(BypassLevel::Feature),
            "component" | "l2" => Some(BypassLevel::Component),
            "system" | "l3" => Some(BypassLevel::System),
            "startup" | "l4" => Some(BypassLevel::Startup),
            _ => None,
        }
    }
}

#[derive(Default)]
struct State {
    features: BTreeSet<String>,
    components: BTreeSet<String>,
    system: bool,
    startup: bool,
}

pub struct Bypass {
    state: RwLock<State>,
}

impl Bypass {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Parse `INDEXPILOT_BYPASS_MODE`: a comma-separated list of `system`,
    /// `startup`, `component:<name>`, or `feature:<name>`.
    pub fn from_env_value(raw: &str) -> Self {
        let bypass = Self::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once(':') {
                Some(("component", name)) => bypass.set(BypassLevel::Component, name),
                Some(("feature", name)) => bypass.set(BypassLevel::Feature, name),
                None if part == "system" => bypass.set(BypassLevel::System, ""),
                None if part == "startup" => bypass.set(BypassLevel::Startup, ""),
                _ => tracing::warn!("ignoring unrecognized bypass spec {part:?}"),
            }
        }
        bypass
    }

    pub fn set(&self, level: BypassLevel, name: &str) {
        let mut state = self.state.write();
        match level {
            BypassLevel::Feature => {
                state.features.insert(name.to_owned());
            },
            BypassLevel::Component => {
                state.components.insert(name.to_owned());
            },
            BypassLevel::System => state.system = true,
            BypassLevel::Startup => state.startup = true,
        }
    }

    pub fn unset(&self, level: BypassLevel, name: &str) {
        let mut state = self.state.write();
        match level {
            BypassLevel::Feature => {
                state.features.remove(name);
            },
            BypassLevel::Component => {
                state.components.remove(name);
            },
            BypassLevel::System => state.system = false,
            BypassLevel::Startup => state.startup = false,
        }
    }

    /// L3: everything read-only; no DDL under any circumstance.
    pub fn ddl_allowed(&self) -> bool {
        !self.state.read().system
    }

    /// L4: scheduler ticks never fire.
    pub fn startup_inert(&self) -> bool {
        self.state.read().startup
    }

    pub fn component_enabled(&self, name: &str) -> bool {
        let state = self.state.read();
        !state.system && !state.components.contains(name)
    }

    /// Whether the component itself is named in the bypass set, independent
    /// of a system-wide bypass. A system bypass demotes components to
    /// read-only behavior rather than turning them off.
    pub fn component_explicitly_bypassed(&self, name: &str) -> bool {
        self.state.read().components.contains(name)
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        let state = self.state.read();
        !state.system && !state.features.contains(name)
    }

    /// The effective bypass set, as the read API reports it.
    pub fn effective(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "system": state.system,
            "startup": state.startup,
            "components": state.components.iter().collect::<Vec<_>>(),
            "features": state.features.iter().collect::<Vec<_>>(),
        })
    }
}
