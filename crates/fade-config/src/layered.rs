use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration files merged in order: a TOML base followed by a JSON run
/// override. Either layer may be absent.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    pub base: Option<PathBuf>,
    pub run: Option<PathBuf>,
}

impl ConfigLayering {
    /// Picks up `FADE_CONFIG_BASE` and `FADE_CONFIG_RUN`. Paths that do not
    /// exist are ignored.
    pub fn from_env() -> Self {
        let lookup = |key: &str| {
            std::env::var_os(key)
                .map(PathBuf::from)
                .filter(|path| path.exists())
        };
        ConfigLayering {
            base: lookup("FADE_CONFIG_BASE"),
            run: lookup("FADE_CONFIG_RUN"),
        }
    }

    pub fn with_base<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base = Some(path.into());
        self
    }

    pub fn with_run<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.run = Some(path.into());
        self
    }
}

/// Which layer produced a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigLayer {
    Base,
    Run,
}

/// A single leaf that a layer introduced or overwrote.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDiffEvent {
    pub layer: ConfigLayer,
    pub path: String,
    pub previous: Option<Value>,
    pub current: Value,
}

/// Merged configuration tree plus the overrides that shaped it.
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    value: Value,
    events: Vec<ConfigDiffEvent>,
}

impl LayeredConfig {
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut config = LayeredConfig {
            value: Value::Object(Map::new()),
            events: Vec::new(),
        };
        if let Some(path) = layering.base.as_deref() {
            if let Some(layer) = read_layer(path, ConfigLayer::Base)? {
                config.apply(&layer, ConfigLayer::Base);
            }
        }
        if let Some(path) = layering.run.as_deref() {
            if let Some(layer) = read_layer(path, ConfigLayer::Run)? {
                config.apply(&layer, ConfigLayer::Run);
            }
        }
        Ok(config)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn events(&self) -> &[ConfigDiffEvent] {
        &self.events
    }

    /// Applies a final in-memory layer, typically command line overrides.
    pub fn overlay(&mut self, layer: &Value) {
        self.apply(layer, ConfigLayer::Run);
    }

    /// Deserialises the whole merged tree. Missing keys fall back to the
    /// target type's serde defaults.
    pub fn typed<T: DeserializeOwned>(&self) -> Result<T, LayeredConfigError> {
        T::deserialize(&self.value).map_err(|source| LayeredConfigError::Schema { source })
    }

    fn apply(&mut self, layer: &Value, kind: ConfigLayer) {
        let first = self.events.len();
        let mut path = Vec::new();
        merge_into(&mut self.value, layer, &mut path, kind, &mut self.events);
        for event in &self.events[first..] {
            tracing::debug!(
                layer = ?event.layer,
                path = %event.path,
                current = %event.current,
                "config layer applied"
            );
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("merged configuration does not match the expected schema: {source}")]
    Schema {
        #[source]
        source: serde_json::Error,
    },
}

/// Base layers are TOML, run layers JSON. A missing file is an empty layer.
fn read_layer(path: &Path, kind: ConfigLayer) -> Result<Option<Value>, LayeredConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let path_buf = || path.to_path_buf();
    let text = fs::read_to_string(path).map_err(|source| LayeredConfigError::Io {
        path: path_buf(),
        source,
    })?;
    let value = match kind {
        ConfigLayer::Base => {
            let table: toml::Value = toml::from_str(&text)
                .map_err(|source| LayeredConfigError::Toml {
                    path: path_buf(),
                    source,
                })?;
            serde_json::to_value(table)
        }
        ConfigLayer::Run => serde_json::from_str(&text),
    }
    .map_err(|source| LayeredConfigError::Json {
        path: path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Objects merge key by key; anything else replaces the destination. Every
/// leaf whose value changes is reported under its dotted path.
fn merge_into(
    dest: &mut Value,
    src: &Value,
    path: &mut Vec<String>,
    layer: ConfigLayer,
    events: &mut Vec<ConfigDiffEvent>,
) {
    if dest.is_null() && src.is_object() {
        *dest = Value::Object(Map::new());
    }
    if let (Value::Object(dest_map), Value::Object(src_map)) = (&mut *dest, src) {
        for (key, value) in src_map {
            path.push(key.clone());
            let slot = dest_map.entry(key.clone()).or_insert(Value::Null);
            merge_into(slot, value, path, layer, events);
            path.pop();
        }
        return;
    }
    if dest == src {
        return;
    }
    let previous = std::mem::replace(dest, src.clone());
    events.push(ConfigDiffEvent {
        layer,
        path: path.join("."),
        previous: (!previous.is_null()).then_some(previous),
        current: src.clone(),
    });
}
