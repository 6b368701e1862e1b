//! Instruments, properties and the registry that resolves axis paths.
//!
//! An [`Instrument`] owns its axes, keyed by path relative to the instrument
//! (`stages[0]`, `device`). The [`InstrumentRegistry`] resolves fully
//! qualified paths (`mc.stages[0]`) to the owning axis or property.
//!
//! Scan sequences never receive the registry itself in inverted control;
//! they receive [`ScopeAccessors`], a read-only map from scope name to a path
//! builder, resolved once before the sequence is built.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::axis::Axis;
use crate::error::{AppResult, DaqError};
use crate::value::{AxisPath, Value};

/// One allowed value of a choice property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Human-facing key, e.g. `"2 mW"`.
    pub key: String,
    /// Value sent to the hardware.
    pub value: Value,
}

/// A settable instrument parameter, optionally restricted to choices.
pub struct Property {
    name: String,
    value: Mutex<Value>,
    choices: Option<Vec<Choice>>,
}

impl Property {
    /// Free-valued property.
    pub fn new(name: impl Into<String>, initial: Value) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(initial),
            choices: None,
        }
    }

    /// Property restricted to `choices`, starting at the first.
    pub fn choice(name: impl Into<String>, choices: Vec<Choice>) -> AppResult<Self> {
        let name = name.into();
        let initial = choices
            .first()
            .map(|c| c.value.clone())
            .ok_or_else(|| DaqError::Configuration(format!("property '{name}' has no choices")))?;
        Ok(Self {
            name,
            value: Mutex::new(initial),
            choices: Some(choices),
        })
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allowed choices, if restricted.
    pub fn choices(&self) -> Option<&[Choice]> {
        self.choices.as_deref()
    }

    /// Current value.
    pub fn get(&self) -> Value {
        self.value.lock().clone()
    }

    /// Set the value, checking it against the allowed choices.
    pub fn set(&self, value: Value) -> AppResult<()> {
        if let Some(choices) = &self.choices {
            if !choices.iter().any(|c| c.value == value) {
                return Err(DaqError::InvalidValue(format!(
                    "{value} is not a valid choice for {}",
                    self.name
                )));
            }
        }
        *self.value.lock() = value;
        Ok(())
    }
}

/// A named collection of axes and properties.
pub struct Instrument {
    name: String,
    axes: BTreeMap<String, Arc<dyn Axis>>,
    properties: BTreeMap<String, Arc<Property>>,
}

impl Instrument {
    /// Empty instrument.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            axes: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Add an axis at `path` relative to the instrument.
    pub fn with_axis(mut self, path: &str, axis: Arc<dyn Axis>) -> Self {
        self.axes.insert(AxisPath::parse(path).to_string(), axis);
        self
    }

    /// Add a list of axes at `name[0]`, `name[1]`, ...
    pub fn with_axis_list(mut self, name: &str, axes: Vec<Arc<dyn Axis>>) -> Self {
        for (i, axis) in axes.into_iter().enumerate() {
            self.axes
                .insert(AxisPath::parse(name).index(i).to_string(), axis);
        }
        self
    }

    /// Add a property.
    pub fn with_property(self, property: Property) -> Self {
        self.with_shared_property(Arc::new(property))
    }

    /// Add a property that other components also hold.
    pub fn with_shared_property(mut self, property: Arc<Property>) -> Self {
        self.properties.insert(property.name().to_string(), property);
        self
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Axis at a relative path.
    pub fn axis(&self, path: &AxisPath) -> Option<Arc<dyn Axis>> {
        self.axes.get(&path.to_string()).cloned()
    }

    /// Property at a relative path.
    pub fn property(&self, path: &AxisPath) -> Option<Arc<Property>> {
        self.properties.get(&path.to_string()).cloned()
    }

    /// Relative axis paths.
    pub fn axis_paths(&self) -> impl Iterator<Item = &str> {
        self.axes.keys().map(String::as_str)
    }

    /// Relative property names.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }
}

/// All instruments of the application, by scope name.
#[derive(Default)]
pub struct InstrumentRegistry {
    instruments: BTreeMap<String, Arc<Instrument>>,
}

impl InstrumentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instrument under its name.
    pub fn register(&mut self, instrument: Instrument) {
        self.instruments
            .insert(instrument.name().to_string(), Arc::new(instrument));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, instrument: Instrument) -> Self {
        self.register(instrument);
        self
    }

    /// Instrument by scope name.
    pub fn instrument(&self, name: &str) -> Option<Arc<Instrument>> {
        self.instruments.get(name).cloned()
    }

    /// Scope names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instruments.keys().map(String::as_str)
    }

    /// Resolve a fully-qualified axis path.
    pub fn axis(&self, path: &AxisPath) -> AppResult<Arc<dyn Axis>> {
        path.scope()
            .and_then(|scope| self.instruments.get(scope))
            .and_then(|instrument| instrument.axis(&path.relative()))
            .ok_or_else(|| DaqError::UnknownPath(path.to_string()))
    }

    /// Resolve a fully-qualified property path.
    pub fn property(&self, path: &AxisPath) -> AppResult<Arc<Property>> {
        path.scope()
            .and_then(|scope| self.instruments.get(scope))
            .and_then(|instrument| instrument.property(&path.relative()))
            .ok_or_else(|| DaqError::UnknownPath(path.to_string()))
    }

    /// Snapshots of every axis carrying persistent state, by full path.
    pub fn collect_axis_state(&self) -> BTreeMap<String, serde_json::Value> {
        let mut states = BTreeMap::new();
        for (scope, instrument) in &self.instruments {
            for (path, axis) in &instrument.axes {
                match axis.snapshot() {
                    Ok(Some(state)) => {
                        states.insert(format!("{scope}.{path}"), state);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(axis = %path, error = %e, "Failed to snapshot axis state"),
                }
            }
        }
        states
    }

    /// Restore axis snapshots collected by
    /// [`collect_axis_state`](Self::collect_axis_state). Unknown paths are skipped.
    pub fn restore_axis_state(&self, states: BTreeMap<String, serde_json::Value>) {
        for (path, state) in states {
            match self.axis(&AxisPath::parse(&path)) {
                Ok(axis) => {
                    if let Err(e) = axis.restore(state) {
                        warn!(axis = %path, error = %e, "Failed to restore axis state");
                    }
                }
                Err(_) => warn!(axis = %path, "No axis to restore state into"),
            }
        }
    }
}

/// Path builder for one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeAccessor {
    scope: String,
}

impl ScopeAccessor {
    /// Scope name.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Full path of a member, e.g. `accessor.path("stages[0]")`.
    pub fn path(&self, member: &str) -> AxisPath {
        AxisPath::parse(&self.scope).child(member)
    }
}

/// Read-only map from scope name to [`ScopeAccessor`].
#[derive(Debug, Clone, Default)]
pub struct ScopeAccessors {
    scopes: BTreeMap<String, ScopeAccessor>,
}

impl ScopeAccessors {
    /// Resolve every registered scope.
    pub fn resolve(registry: &InstrumentRegistry) -> Self {
        let scopes = registry
            .names()
            .map(|name| {
                (
                    name.to_string(),
                    ScopeAccessor {
                        scope: name.to_string(),
                    },
                )
            })
            .collect();
        Self { scopes }
    }

    /// Accessor for `scope`.
    pub fn get(&self, scope: &str) -> AppResult<&ScopeAccessor> {
        self.scopes
            .get(scope)
            .ok_or_else(|| DaqError::UnknownPath(scope.to_string()))
    }

    /// Scope names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::SimulatedAxis;

    fn registry() -> InstrumentRegistry {
        let stages: Vec<Arc<dyn Axis>> = (0..2)
            .map(|i| {
                Arc::new(SimulatedAxis::writable(format!("stage{i}"), Value::Float(0.0)))
                    as Arc<dyn Axis>
            })
            .collect();
        InstrumentRegistry::new().with(
            Instrument::new("mc")
                .with_axis_list("stages", stages)
                .with_property(
                    Property::choice(
                        "range",
                        vec![
                            Choice {
                                key: "low".into(),
                                value: Value::Int(0),
                            },
                            Choice {
                                key: "high".into(),
                                value: Value::Int(1),
                            },
                        ],
                    )
                    .unwrap(),
                ),
        )
    }

    #[tokio::test]
    async fn resolves_full_paths() {
        let registry = registry();
        let axis = registry.axis(&"mc.stages[1]".into()).unwrap();
        assert_eq!(axis.name(), "stage1");
        assert!(registry.axis(&"mc.stages[2]".into()).is_err());
        assert!(registry.axis(&"other.x".into()).is_err());
    }

    #[test]
    fn choice_property_validates() {
        let registry = registry();
        let range = registry.property(&"mc.range".into()).unwrap();
        assert_eq!(range.get(), Value::Int(0));
        range.set(Value::Int(1)).unwrap();
        assert_eq!(range.get(), Value::Int(1));
        assert!(range.set(Value::Int(7)).is_err());
    }

    #[test]
    fn scope_accessors_build_paths() {
        let scopes = ScopeAccessors::resolve(&registry());
        let mc = scopes.get("mc").unwrap();
        assert_eq!(mc.path("stages[0]").to_string(), "mc.stages[0]");
        assert!(scopes.get("nope").is_err());
    }
}
