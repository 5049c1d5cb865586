//! The configuration store: a YAML-backed key/value map, consulted once at
//! clock init and available to any node (`SPEC_FULL.md` §4.10, spec §6
//! "Configuration (consumed)").
//!
//! Grounded on `config.hpp`/`config.cpp`'s `Config` singleton (a flat
//! `name -> ConfigValue` map loaded from one YAML file's top-level keys) and
//! `examples/eloff-riverdb/src/riverdb/config/load.rs`'s search order and
//! `${ENV_VAR[:default]}` substitution.

use std::borrow::Cow;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::lbot::common::{Error, Result};
use crate::lbot::config::ConfigValue;

/// The parsed contents of the configuration file: a flat map from parameter
/// name (by convention a `/`-separated path, e.g. `/lbot/clock_mode`) to
/// value.
#[derive(Default)]
pub struct Store {
    params: HashMap<String, ConfigValue>,
}

impl Store {
    fn from_yaml(yaml_text: &str) -> Result<Self> {
        let params: HashMap<String, ConfigValue> = serde_yaml::from_str(yaml_text)?;
        Ok(Store { params })
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.params.get(key)
    }

    /// Look up `key`, falling back to `fallback` if it is absent. Unlike
    /// `get`, never fails — used by the clock's `/lbot/clock_mode` lookup,
    /// which the spec requires to default rather than error (spec §4.7).
    pub fn get_fallback(&self, key: &str, fallback: ConfigValue) -> ConfigValue {
        self.params.get(key).cloned().unwrap_or(fallback)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.params.iter()
    }
}

static STORE: OnceLock<std::result::Result<Store, String>> = OnceLock::new();

/// Return the process-wide configuration store, loading `lbot.yaml` on
/// first call. The load result (success or failure message) is cached for
/// the life of the process.
pub fn store() -> Result<&'static Store> {
    match STORE.get_or_init(|| load("lbot.yaml").map_err(|e| e.to_string())) {
        Ok(store) => Ok(store),
        Err(message) => Err(Error::config_access(message.clone())),
    }
}

/// Load configuration settings from `config_name`, searching in order:
/// 1. the current directory or any of its parents,
/// 2. `~/.config/lbot/{config_name}`,
/// 3. `~/.{config_name}`,
/// 4. `/etc/lbot/{config_name}`.
///
/// `${ENV_VAR[:default]}` parameters in the file are substituted with the
/// named environment variable, or the given default if the variable is
/// unset (mirrors `replace_env_vars` in the teacher's config loader).
pub fn load(config_name: &str) -> Result<Store> {
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy().into_owned(), "found config file");
    let raw_yaml = std::fs::read_to_string(&config_path)?;
    let yaml_text = replace_env_vars(&raw_yaml)?;
    Store::from_yaml(&yaml_text)
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        loop {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let candidate = Path::join(dir, config_name);
            if candidate.exists() {
                return Ok(candidate);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());

    let config_dir_candidate = Path::join(Path::new(&home), Path::join(Path::new(".config/lbot"), config_name));
    debug!("checking for config file in {}", config_dir_candidate.to_string_lossy());
    if config_dir_candidate.exists() {
        return Ok(config_dir_candidate);
    }

    let dotfile_candidate = Path::join(Path::new(&home), format!(".{config_name}"));
    debug!("checking for config file in {}", dotfile_candidate.to_string_lossy());
    if dotfile_candidate.exists() {
        return Ok(dotfile_candidate);
    }

    let etc_candidate = Path::join(Path::new("/etc/lbot"), config_name);
    debug!("checking for config file in {}", etc_candidate.to_string_lossy());
    if etc_candidate.exists() {
        return Ok(etc_candidate);
    }

    Err(Error::config_access(format!("config file '{config_name}' not found")))
}

fn replace_env_vars(raw_yaml: &str) -> Result<Cow<str>> {
    let re_var = Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)(?::([^}]*?))?\}").unwrap();

    let mut errors = Vec::<String>::new();

    let replaced = re_var.replace_all(raw_yaml, |caps: &Captures| match env::var(&caps[1]) {
        Ok(val) => val,
        Err(_) => match caps.get(2) {
            Some(default) => default.as_str().to_string(),
            None => {
                errors.push(format!("environment variable {} is required but not defined", &caps[1]));
                String::new()
            }
        },
    });

    if errors.is_empty() {
        Ok(replaced)
    } else {
        Err(Error::config_access(errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_env_log::test;

    #[test]
    fn test_from_yaml_parses_flat_keys() {
        let store = Store::from_yaml("/lbot/clock_mode: custom\nmax_rate: 10\nratio: 0.5\n").unwrap();
        assert_eq!(store.get("/lbot/clock_mode").unwrap().as_str(), Some("custom"));
        assert_eq!(store.get("max_rate").unwrap().as_int().unwrap(), 10);
        assert_eq!(store.get("ratio").unwrap().as_float().unwrap(), 0.5);
    }

    #[test]
    fn test_get_fallback_returns_default_when_absent() {
        let store = Store::from_yaml("foo: bar\n").unwrap();
        let value = store.get_fallback("/lbot/clock_mode", ConfigValue::String("system".into()));
        assert_eq!(value.as_str(), Some("system"));
    }

    #[test]
    fn test_replace_env_vars_substitutes_and_defaults() {
        std::env::set_var("LBOT_TEST_VAR", "seventeen");
        let text = replace_env_vars("value: ${LBOT_TEST_VAR}\nother: ${LBOT_MISSING_VAR:fallback}\n").unwrap();
        assert!(text.contains("value: seventeen"));
        assert!(text.contains("other: fallback"));
        std::env::remove_var("LBOT_TEST_VAR");
    }

    #[test]
    fn test_replace_env_vars_errors_on_missing_required() {
        std::env::remove_var("LBOT_DEFINITELY_MISSING");
        let err = replace_env_vars("value: ${LBOT_DEFINITELY_MISSING}\n").unwrap_err();
        assert!(matches!(err.kind(), crate::lbot::common::ErrorKind::ConfigAccess(_)));
    }
}
