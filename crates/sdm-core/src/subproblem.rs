//! Subproblem declarations returned by builders.
//!
//! Besides the model itself a builder declares its coupling slots:
//!
//! - **inputs**: values received from the parent node; each input must
//!   match a parent output of the same name and dimension
//! - **outputs**: values offered to the node's children
//!
//! Slots are resolved to [`VarId`] handles once, at build time.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Model, VarId};

/// Which side of a coupling a slot sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSide {
    Input,
    Output,
}

/// Fully qualified slot reference within one node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub side: SlotSide,
    pub name: String,
}

impl SlotKey {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            side: SlotSide::Input,
            name: name.into(),
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self {
            side: SlotSide::Output,
            name: name.into(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side {
            SlotSide::Input => write!(f, "in:{}", self.name),
            SlotSide::Output => write!(f, "out:{}", self.name),
        }
    }
}

/// A node's model plus its declared coupling slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subproblem {
    pub model: Model,
    pub inputs: BTreeMap<String, Vec<VarId>>,
    pub outputs: BTreeMap<String, Vec<VarId>>,
}

impl Subproblem {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, vars: Vec<VarId>) -> Self {
        self.inputs.insert(name.into(), vars);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, vars: Vec<VarId>) -> Self {
        self.outputs.insert(name.into(), vars);
        self
    }

    pub fn input(&self, name: &str) -> Option<&[VarId]> {
        self.inputs.get(name).map(Vec::as_slice)
    }

    pub fn output(&self, name: &str) -> Option<&[VarId]> {
        self.outputs.get(name).map(Vec::as_slice)
    }

    pub fn slot(&self, key: &SlotKey) -> Option<&[VarId]> {
        match key.side {
            SlotSide::Input => self.input(&key.name),
            SlotSide::Output => self.output(&key.name),
        }
    }

    /// Read a slot's values out of a primal vector.
    pub fn slot_values(&self, key: &SlotKey, primal: &[f64]) -> Option<Vec<f64>> {
        self.slot(key)
            .map(|vars| vars.iter().map(|v| primal[v.value()]).collect())
    }
}
