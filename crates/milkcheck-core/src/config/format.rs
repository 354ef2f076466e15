//! Serde schema of the YAML configuration documents.
//!
//! Maps are kept as [`serde_yaml::Mapping`] so declaration order survives
//! into the graph: dependency and variable ordering is insertion order
//! everywhere in the engine.

use serde::Deserialize;

/// One YAML document: global variables plus a service map.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDoc {
    #[serde(default)]
    pub variables: serde_yaml::Mapping,
    #[serde(default)]
    pub services: serde_yaml::Mapping,
}

/// A service entry: either a plain service (with `actions`) or a service
/// group (with nested `services`).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDoc {
    pub desc: Option<String>,
    pub target: Option<String>,
    pub fanout: Option<usize>,
    pub errors: Option<usize>,
    /// Seconds; zero or absent disables the timeout.
    pub timeout: Option<f64>,
    /// Seconds before dispatch, inherited by actions without their own.
    pub delay: Option<f64>,
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub variables: serde_yaml::Mapping,
    #[serde(default)]
    pub require: Vec<String>,
    #[serde(default)]
    pub require_weak: Vec<String>,
    #[serde(default)]
    pub check: Vec<String>,
    #[serde(default)]
    pub actions: serde_yaml::Mapping,
    /// Nested services; sibling dependencies become internal edges.
    #[serde(default)]
    pub services: serde_yaml::Mapping,
}

/// One named action of a service.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDoc {
    pub cmd: Option<String>,
    pub target: Option<String>,
    pub timeout: Option<f64>,
    pub delay: Option<f64>,
    pub retry: Option<u32>,
    pub errors: Option<usize>,
    pub fanout: Option<usize>,
    #[serde(default)]
    pub variables: serde_yaml::Mapping,
    /// Sibling actions that must settle first.
    #[serde(default)]
    pub require: Vec<String>,
}
