//! Per-node realization data.
//!
//! A realization is an opaque bag of named parameters attached to a tree
//! node (demands, prices, yields...). The coordinators never look inside;
//! only subproblem builders do.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single named parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// Named parameters describing one node's outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Realization {
    params: BTreeMap<String, Param>,
}

impl Realization {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style scalar insertion.
    pub fn with_scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), Param::Scalar(value));
        self
    }

    /// Builder-style vector insertion.
    pub fn with_vector(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.params.insert(name.into(), Param::Vector(values));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Param) {
        self.params.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.get(name)
    }

    /// Scalar parameter; a one-element vector also qualifies.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.params.get(name)? {
            Param::Scalar(v) => Some(*v),
            Param::Vector(v) if v.len() == 1 => Some(v[0]),
            Param::Vector(_) => None,
        }
    }

    /// Vector parameter; a scalar is returned as a one-element slice.
    pub fn vector(&self, name: &str) -> Option<&[f64]> {
        match self.params.get(name)? {
            Param::Scalar(v) => Some(std::slice::from_ref(v)),
            Param::Vector(v) => Some(v.as_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Param)> for Realization {
    fn from_iter<I: IntoIterator<Item = (String, Param)>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}
