//! # okeconfig - OkeRoom configuration
//!
//! One YAML tree drives the whole server. The defaults embedded in the
//! binary are overlaid with an optional `config.yaml` from the config
//! directory, then with `OKEROOM_CONFIG__section__key` environment
//! variables. Keys are matched case-insensitively. The merged tree is
//! written back on startup, so a fresh deployment ends up with a
//! complete, editable file.
//!
//! ```no_run
//! use okeconfig::get_config;
//!
//! let config = get_config();
//! let port = config.get_http_port();
//! config.set_http_port(9040)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;
use serde_yaml::{Mapping, Number, Value};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Embedded default configuration
const DEFAULT_CONFIG: &str = include_str!("okeroom.yaml");

const ENV_CONFIG_DIR: &str = "OKEROOM_CONFIG";
const ENV_PREFIX: &str = "OKEROOM_CONFIG__";
const CONFIG_DIR_NAME: &str = ".okeroom";
const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_HTTP_PORT: u16 = 8040;
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_CLIENT_BUFFER: usize = 256;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";

static CONFIG: Lazy<Arc<Config>> =
    Lazy::new(|| Arc::new(Config::load_config("").expect("Failed to load OkeRoom configuration")));

/// Returns the global configuration, loaded on first access.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// The OkeRoom configuration tree.
///
/// Values are read and written by key path (`&["room", "client_buffer"]`);
/// every write persists the whole tree back to `config.yaml`.
#[derive(Debug)]
pub struct Config {
    config_dir: PathBuf,
    path: PathBuf,
    data: Mutex<Value>,
}

impl Config {
    /// Loads the configuration rooted at `directory`; an empty string
    /// means: discover the default location.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = discover_config_dir(directory)?;
        info!(config_dir = %config_dir.display(), "Using config directory");

        let path = config_dir.join(CONFIG_FILE);
        let defaults: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        let external = match fs::read_to_string(&path) {
            Ok(text) => {
                info!(config_file = %path.display(), "Loaded config file");
                serde_yaml::from_str(&text)?
            }
            Err(_) => {
                info!(config_file = %path.display(), "No config file yet, using embedded defaults");
                Value::Mapping(Mapping::new())
            }
        };

        let mut tree = overlay(defaults, external);
        apply_env_overrides(&mut tree);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(tree),
        };
        config.save()?;
        Ok(config)
    }

    /// Writes the current tree back to `config.yaml`.
    pub fn save(&self) -> Result<()> {
        let yaml = {
            let data = self.data.lock().unwrap();
            serde_yaml::to_string(&*data)?
        };
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Reads the value at a key path.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock().unwrap();

        let mut node = &*data;
        for (depth, segment) in path.iter().enumerate() {
            let map = node
                .as_mapping()
                .ok_or_else(|| anyhow!("'{}' is not a section", path[..depth].join(".")))?;
            node = entry_value(map, segment)
                .ok_or_else(|| anyhow!("No value at '{}'", path[..=depth].join(".")))?;
        }
        Ok(node.clone())
    }

    /// Sets the value at a key path and persists the tree. Missing
    /// intermediate sections are created.
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.data.lock().unwrap();
            plant(&mut data, path, value)?;
        }
        self.save()
    }

    fn u64_or(&self, path: &[&str], default: u64) -> u64 {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Ok(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    fn bool_or(&self, path: &[&str], default: bool) -> bool {
        match self.get_value(path) {
            Ok(Value::Bool(b)) => b,
            _ => default,
        }
    }

    fn string_or(&self, path: &[&str], default: &str) -> String {
        match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => default.to_string(),
        }
    }

    /// HTTP port of the WebSocket endpoint.
    pub fn get_http_port(&self) -> u16 {
        let port = self.u64_or(&["host", "http_port"], u64::from(DEFAULT_HTTP_PORT));
        u16::try_from(port).unwrap_or_else(|_| {
            tracing::warn!(port, "Configured HTTP port out of range, using default");
            DEFAULT_HTTP_PORT
        })
    }

    pub fn set_http_port(&self, port: u16) -> Result<()> {
        self.set_value(&["host", "http_port"], Value::Number(Number::from(port)))
    }

    /// Bind address of the HTTP listener.
    pub fn get_bind_address(&self) -> String {
        self.string_or(&["host", "bind"], DEFAULT_BIND)
    }

    /// Capacity of each client's send buffer.
    pub fn get_client_buffer(&self) -> usize {
        self.u64_or(&["room", "client_buffer"], DEFAULT_CLIENT_BUFFER as u64) as usize
    }

    /// Minimum log level when `RUST_LOG` is not set.
    pub fn get_log_min_level(&self) -> String {
        self.string_or(&["host", "logger", "min_level"], DEFAULT_LOG_MIN_LEVEL)
    }

    pub fn get_log_enable_console(&self) -> bool {
        self.bool_or(&["host", "logger", "enable_console"], true)
    }

    /// Returns (and creates) a directory managed through the
    /// configuration.
    ///
    /// Relative paths resolve against the config directory. A missing key
    /// is written back with the given default, so the saved file lists
    /// every tunable.
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<String> {
        let configured = match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => {
                self.set_managed_dir(path, default.to_string())?;
                default.to_string()
            }
        };

        let mut dir = PathBuf::from(&configured);
        if dir.is_relative() {
            dir = self.config_dir.join(dir);
        }
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            info!(directory = %dir.display(), "Created managed directory");
        }
        Ok(dir.to_string_lossy().into_owned())
    }

    /// Sets a managed directory (absolute, or relative to the config
    /// directory).
    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }
}

/// Picks the configuration directory: an explicit argument wins, then
/// `$OKEROOM_CONFIG`, then an existing `.okeroom` in the working or home
/// directory. A fresh install falls back to `./.okeroom`. The directory
/// is created and must be writable — both SQLite databases default to
/// living under it.
fn discover_config_dir(explicit: &str) -> Result<PathBuf> {
    let chosen = if !explicit.is_empty() {
        PathBuf::from(explicit)
    } else if let Ok(from_env) = env::var(ENV_CONFIG_DIR) {
        info!(env_var = ENV_CONFIG_DIR, path = %from_env, "Config directory from environment");
        PathBuf::from(from_env)
    } else {
        let local = PathBuf::from(CONFIG_DIR_NAME);
        match dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME)) {
            Some(home) if !local.exists() && home.exists() => home,
            _ => local,
        }
    };

    fs::create_dir_all(&chosen)?;
    if !chosen.is_dir() {
        bail!("Config path {} is not a directory", chosen.display());
    }

    // Fail now rather than at the first database write.
    let probe = chosen.join(".probe");
    fs::write(&probe, b"ok").map_err(|e| {
        anyhow!(
            "Config directory {} is not writable: {}",
            chosen.display(),
            e
        )
    })?;
    let _ = fs::remove_file(&probe);

    Ok(chosen)
}

/// Folds `layer` into `base`. Mappings merge key by key (matched
/// case-insensitively, stored lowercase); for any other pair the layer
/// value wins.
fn overlay(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Mapping(base_map), Value::Mapping(layer_map)) => {
            let mut merged: Mapping = base_map
                .into_iter()
                .map(|(key, value)| (lower_key(key), value))
                .collect();

            for (key, value) in layer_map {
                let key = lower_key(key);
                let folded = match merged.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                merged.insert(key, folded);
            }
            Value::Mapping(merged)
        }
        (_, layer) => layer,
    }
}

fn lower_key(key: Value) -> Value {
    match key {
        Value::String(s) => Value::String(s.to_ascii_lowercase()),
        other => other,
    }
}

/// Case-insensitive mapping read.
fn entry_value<'a>(map: &'a Mapping, segment: &str) -> Option<&'a Value> {
    map.iter().find_map(|(key, value)| match key {
        Value::String(s) if s.eq_ignore_ascii_case(segment) => Some(value),
        _ => None,
    })
}

/// The key actually present for `segment`, or a fresh lowercase one.
fn canonical_key(map: &Mapping, segment: &str) -> Value {
    map.keys()
        .find(|key| matches!(key, Value::String(s) if s.eq_ignore_ascii_case(segment)))
        .cloned()
        .unwrap_or_else(|| Value::String(segment.to_ascii_lowercase()))
}

/// Walks (and grows) the tree down to the last path segment and sets the
/// value there.
fn plant(tree: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        bail!("Empty configuration path");
    };

    let mut node = tree;
    for segment in parents {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| anyhow!("'{}' is not a section", segment))?;
        let key = canonical_key(map, segment);
        node = map
            .entry(key)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }

    let map = node
        .as_mapping_mut()
        .ok_or_else(|| anyhow!("'{}' is not a section", last))?;
    let key = canonical_key(map, last);
    map.insert(key, value);
    Ok(())
}

/// Applies `OKEROOM_CONFIG__section__key=value` overrides on top of the
/// merged tree.
fn apply_env_overrides(tree: &mut Value) {
    for (variable, raw) in env::vars().filter(|(name, _)| name.starts_with(ENV_PREFIX)) {
        let path: Vec<&str> = variable[ENV_PREFIX.len()..].split("__").collect();
        if let Err(e) = plant(tree, &path, scalar_from_env(&raw)) {
            tracing::warn!(variable = %variable, error = %e, "Ignoring malformed override");
        }
    }
}

/// Environment overrides are scalars: booleans and numbers decode to
/// their YAML types, everything else stays a string.
fn scalar_from_env(raw: &str) -> Value {
    if let Ok(flag) = raw.parse::<bool>() {
        return Value::Bool(flag);
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(Number::from(int));
    }
    if let Ok(float) = raw.parse::<f64>() {
        return Value::Number(Number::from(float));
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        Config::load_config(dir.to_str().unwrap()).expect("load config")
    }

    #[test]
    fn defaults_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        assert_eq!(config.get_http_port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.get_bind_address(), DEFAULT_BIND);
        assert_eq!(config.get_client_buffer(), DEFAULT_CLIENT_BUFFER);
        assert!(config.get_log_enable_console());
    }

    #[test]
    fn set_value_round_trips_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        config.set_http_port(9999).unwrap();
        assert_eq!(config.get_http_port(), 9999);

        // A fresh load must see the persisted value.
        let reloaded = test_config(dir.path());
        assert_eq!(reloaded.get_http_port(), 9999);
    }

    #[test]
    fn keys_match_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        config
            .set_value(
                &["Room", "Countdown_Seconds"],
                Value::Number(Number::from(15)),
            )
            .unwrap();
        let value = config.get_value(&["room", "countdown_seconds"]).unwrap();
        assert_eq!(value, Value::Number(Number::from(15)));

        // Mixed-case reads resolve to the same entry; no duplicate key
        // appears in the section.
        let value = config.get_value(&["ROOM", "COUNTDOWN_SECONDS"]).unwrap();
        assert_eq!(value, Value::Number(Number::from(15)));
        let section = config.get_value(&["room"]).unwrap();
        let keys = section.as_mapping().unwrap().len();
        let reloaded = test_config(dir.path());
        assert_eq!(
            reloaded.get_value(&["room"]).unwrap().as_mapping().unwrap().len(),
            keys
        );
    }

    #[test]
    fn overlay_merges_sections_and_layer_wins() {
        let base: Value = serde_yaml::from_str("host:\n  http_port: 8040\n  bind: \"0.0.0.0\"\n").unwrap();
        let layer: Value = serde_yaml::from_str("Host:\n  http_port: 9000\nextra: true\n").unwrap();

        let merged = overlay(base, layer);
        let map = merged.as_mapping().unwrap();
        assert_eq!(map.len(), 2, "'host' and 'Host' fold into one section");

        let host = entry_value(map, "host").unwrap().as_mapping().unwrap();
        assert_eq!(
            entry_value(host, "http_port"),
            Some(&Value::Number(Number::from(9000)))
        );
        assert_eq!(
            entry_value(host, "bind"),
            Some(&Value::String("0.0.0.0".to_string()))
        );
    }

    #[test]
    fn env_scalars_decode_to_yaml_types() {
        assert_eq!(scalar_from_env("true"), Value::Bool(true));
        assert_eq!(scalar_from_env("8041"), Value::Number(Number::from(8041)));
        assert_eq!(
            scalar_from_env("127.0.0.1"),
            Value::String("127.0.0.1".to_string())
        );
    }

    #[test]
    fn managed_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let managed = config
            .get_managed_dir(&["sessions", "directory"], "state")
            .unwrap();
        assert!(Path::new(&managed).is_dir());
    }

    #[test]
    fn unknown_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        assert!(config.get_value(&["does", "not", "exist"]).is_err());
    }
}
