//! `ConfigValue`: a small variant type mirroring `config.hpp`'s
//! `std::variant<std::monostate, bool, i64, double, std::string, Sequence>`
//! (`SPEC_FULL.md` §3 "ConfigValue").

use serde::Deserialize;

use crate::lbot::common::{Error, Result};

/// One parameter's value in the configuration store. `Sequence` nests
/// further values, mirroring a YAML list of scalars or of further lists.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<ConfigValue>),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ConfigValue::Bool(v) => Ok(*v),
            _ => Err(Error::config_access("value is not a bool")),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            ConfigValue::Int(v) => Ok(*v),
            _ => Err(Error::config_access("value is not an int")),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            ConfigValue::Float(v) => Ok(*v),
            ConfigValue::Int(v) => Ok(*v as f64),
            _ => Err(Error::config_access("value is not a float")),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Result<&[ConfigValue]> {
        match self {
            ConfigValue::Sequence(v) => Ok(v),
            _ => Err(Error::config_access("value is not a sequence")),
        }
    }
}
