//! Parameter groups: the settable values of a parameterized operation,
//! e.g. the defining constants of a map projection kernel.

use crate::cs::Unit;
use crate::Error;
use std::collections::BTreeMap;

// The parameter names filled in from a bound ellipsoid
pub(crate) const SEMI_MAJOR: &str = "semi_major";
pub(crate) const SEMI_MINOR: &str = "semi_minor";
pub(crate) const INVERSE_FLATTENING: &str = "inverse_flattening";

/// The description of one parameter: its name, unit, and the default
/// used when no value is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterDescriptor {
    pub name: &'static str,
    pub unit: Unit,
    pub default: Option<f64>,
}

impl ParameterDescriptor {
    pub const fn new(name: &'static str, unit: Unit, default: Option<f64>) -> ParameterDescriptor {
        ParameterDescriptor {
            name,
            unit,
            default,
        }
    }

    /// A fresh, unset value for this parameter.
    pub fn create_value(&self) -> ParameterValue {
        ParameterValue {
            descriptor: *self,
            value: None,
        }
    }
}

/// The descriptors every ellipsoid-based kernel carries.
pub const ELLIPSOID_PARAMETERS: [ParameterDescriptor; 3] = [
    ParameterDescriptor::new(SEMI_MAJOR, Unit::Metre, None),
    ParameterDescriptor::new(SEMI_MINOR, Unit::Metre, None),
    ParameterDescriptor::new(INVERSE_FLATTENING, Unit::Metre, None),
];

/// One settable parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterValue {
    descriptor: ParameterDescriptor,
    value: Option<f64>,
}

impl ParameterValue {
    pub fn descriptor(&self) -> &ParameterDescriptor {
        &self.descriptor
    }

    pub fn set(&mut self, value: f64) {
        self.value = Some(value);
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// The explicit value, if one was set.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// The explicit value, or the descriptor's default.
    pub fn or_default(&self) -> Option<f64> {
        self.value.or(self.descriptor.default)
    }
}

/// A named group of parameter values. Groups copy: a value set on a
/// clone never affects the original.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroup {
    name: String,
    values: BTreeMap<&'static str, ParameterValue>,
}

impl ParameterGroup {
    pub fn new(name: &str, descriptors: &[ParameterDescriptor]) -> ParameterGroup {
        let values = descriptors
            .iter()
            .map(|d| (d.name, d.create_value()))
            .collect();
        ParameterGroup {
            name: name.to_string(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The settable value registered under `name`.
    pub fn parameter(&mut self, name: &str) -> Result<&mut ParameterValue, Error> {
        self.values
            .get_mut(name)
            .ok_or_else(|| Error::Invalid(format!("no parameter '{name}' in this group")))
    }

    /// Non-failing lookup, for parameters that may legitimately be
    /// absent from a kernel's gamut.
    pub fn find(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut ParameterValue> {
        self.values.get_mut(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.values.values().map(ParameterValue::descriptor)
    }
}

// ----- T E S T S ------------------------------------------------------------------
