//! The `config.yml` at a storage root: hash algorithm, key layout, tool
//! selection and capacity bounds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StorageError;
use crate::storage::{validate_levels, HashAlgorithm};
use crate::tools::fs::RootParams;
use crate::tools::{
    DummyLabels, DummyLocker, DummySize, DummyUsage, GlobalThreadLocker, JsonLabels,
    LabelsStorage, Locker, RedisLocker, RedisSize, SizeTracker, StatUsage, UsageTracker,
};

pub const CONFIG_NAME: &str = "config.yml";

/// Selects one of the tool implementations by name, with optional
/// positional and keyword arguments. A bare string is shorthand for
/// `{name: <string>}`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, serde_yaml::Value>,
}

impl ToolConfig {
    fn kwarg(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.kwargs.get(name)
    }

    fn kwarg_str(&self, name: &str) -> Result<Option<String>, StorageError> {
        match self.kwarg(name) {
            None => Ok(None),
            Some(serde_yaml::Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(StorageError::Config(format!(
                "{}.{} must be a string, got {:?}",
                self.name, name, other
            ))),
        }
    }

    fn kwarg_u64(&self, name: &str) -> Result<Option<u64>, StorageError> {
        match self.kwarg(name) {
            None => Ok(None),
            Some(serde_yaml::Value::Number(value)) => value.as_u64().ok_or_else(|| {
                StorageError::Config(format!("{}.{} must be a non-negative integer", self.name, name))
            }).map(Some),
            Some(other) => Err(StorageError::Config(format!(
                "{}.{} must be an integer, got {:?}",
                self.name, name, other
            ))),
        }
    }

    /// The first positional argument, if it is a string.
    fn first_arg_str(&self) -> Option<String> {
        match self.args.first() {
            Some(serde_yaml::Value::String(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for ToolConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Full {
                name: String,
                #[serde(default)]
                args: Vec<serde_yaml::Value>,
                #[serde(default)]
                kwargs: BTreeMap<String, serde_yaml::Value>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Name(name) => ToolConfig { name, args: Vec::new(), kwargs: BTreeMap::new() },
            Repr::Full { name, args, kwargs } => ToolConfig { name, args, kwargs },
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locker: Option<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<ToolConfig>,
    /// Writes are refused while the filesystem has less free space than
    /// this. 0 disables the check.
    #[serde(default, deserialize_with = "deserialize_size")]
    pub free_disk_size: u64,
    /// Writes are refused once the tracked size exceeds this.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "deserialize_opt_size")]
    pub max_size: Option<u64>,
}

impl StorageConfig {
    /// The key layout, defaulting to `[1, digest_size - 1]` when the hash
    /// is known and `[1, -1]` otherwise.
    pub fn effective_levels(&self) -> Vec<i64> {
        match (&self.levels, &self.hash) {
            (Some(levels), _) => levels.clone(),
            (None, Some(hash)) => vec![1, hash.digest_size() as i64 - 1],
            (None, None) => vec![1, -1],
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        validate_levels(&self.effective_levels(), self.hash.map(|hash| hash.digest_size()))
    }

    pub fn make_locker(&self) -> Result<Box<dyn Locker>, StorageError> {
        let config = match &self.locker {
            None => return Ok(Box::new(DummyLocker)),
            Some(config) => config,
        };
        match config.name.as_str() {
            "dummy" => Ok(Box::new(DummyLocker)),
            "global" => {
                let timeout = config.kwarg_u64("timeout")?.map(Duration::from_secs);
                Ok(Box::new(GlobalThreadLocker::new(timeout)))
            }
            "redis" => {
                let url = config
                    .first_arg_str()
                    .or(config.kwarg_str("url")?)
                    .ok_or_else(|| StorageError::Config("redis locker needs a url".into()))?;
                let prefix = config.kwarg_str("prefix")?.unwrap_or_default();
                let expire = config.kwarg_u64("expire")?.unwrap_or(60);
                Ok(Box::new(RedisLocker::from_url(&url, prefix.as_bytes(), expire)?))
            }
            other => Err(StorageError::Config(format!("unknown locker: {}", other))),
        }
    }

    pub fn make_size(&self) -> Result<Box<dyn SizeTracker>, StorageError> {
        let config = match &self.size {
            None => return Ok(Box::new(DummySize)),
            Some(config) => config,
        };
        match config.name.as_str() {
            "dummy" => Ok(Box::new(DummySize)),
            "redis" => {
                let url = config
                    .first_arg_str()
                    .or(config.kwarg_str("url")?)
                    .ok_or_else(|| StorageError::Config("redis size tracker needs a url".into()))?;
                let prefix = config.kwarg_str("prefix")?.unwrap_or_default();
                Ok(Box::new(RedisSize::from_url(&url, &prefix)?))
            }
            other => Err(StorageError::Config(format!("unknown size tracker: {}", other))),
        }
    }

    pub fn make_usage(
        &self,
        root: PathBuf,
        params: RootParams,
    ) -> Result<Box<dyn UsageTracker>, StorageError> {
        let config = match &self.usage {
            None => return Ok(Box::new(DummyUsage)),
            Some(config) => config,
        };
        match config.name.as_str() {
            "dummy" => Ok(Box::new(DummyUsage)),
            "stat" => Ok(Box::new(StatUsage::new(root, params))),
            other => Err(StorageError::Config(format!("unknown usage tracker: {}", other))),
        }
    }

    pub fn make_labels(
        &self,
        root: PathBuf,
        params: RootParams,
    ) -> Result<Box<dyn LabelsStorage>, StorageError> {
        let config = match &self.labels {
            None => return Ok(Box::new(DummyLabels)),
            Some(config) => config,
        };
        match config.name.as_str() {
            "dummy" => Ok(Box::new(DummyLabels)),
            "json" => Ok(Box::new(JsonLabels::new(root, params))),
            other => Err(StorageError::Config(format!("unknown labels storage: {}", other))),
        }
    }
}

/// Parses a byte count: a plain integer, or a number with a decimal
/// (`KB` = 1000) or binary (`KiB` = 1024) suffix.
pub fn parse_size(input: &str) -> Result<u64, StorageError> {
    let input = input.trim();
    let split = input
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or_else(|| input.len());
    let (number, unit) = input.split_at(split);
    let number: f64 = number
        .trim()
        .parse()
        .map_err(|_| StorageError::Config(format!("couldn't understand the size format: {}", input)))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "kib" => 1 << 10,
        "m" | "mb" => 1000_000,
        "mib" => 1 << 20,
        "g" | "gb" => 1000_000_000,
        "gib" => 1 << 30,
        "t" | "tb" => 1000_000_000_000,
        "tib" => 1 << 40,
        _ => {
            return Err(StorageError::Config(format!(
                "couldn't understand the size format: {}",
                input
            )))
        }
    };

    if number < 0.0 {
        return Err(StorageError::Config(format!("negative size: {}", input)));
    }
    Ok((number * multiplier as f64).round() as u64)
}

fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Int(u64),
        Human(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Int(size) => Ok(size),
        Size::Human(text) => parse_size(&text).map_err(D::Error::custom),
    }
}

fn deserialize_opt_size<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Int(u64),
        Human(String),
    }
    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Size::Int(size)) => Ok(Some(size)),
        Some(Size::Human(text)) => parse_size(&text).map(Some).map_err(D::Error::custom),
    }
}

pub fn load_config_buffer(data: &str) -> Result<StorageConfig, StorageError> {
    let config: StorageConfig = serde_yaml::from_str(data)
        .map_err(|err| StorageError::Config(format!("invalid storage config: {}", err)))?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(root: &Path) -> Result<StorageConfig, StorageError> {
    let path = root.join(CONFIG_NAME);
    let data = std::fs::read_to_string(&path)
        .map_err(|err| StorageError::Config(format!("unable to read {:?}: {}", path, err)))?;
    load_config_buffer(&data)
}

/// Creates a storage root and writes its config.
pub fn init_storage(config: &StorageConfig, root: &Path) -> Result<(), StorageError> {
    config.validate()?;
    std::fs::create_dir_all(root)?;
    let raw = serde_yaml::to_string(config)
        .map_err(|err| StorageError::Config(format!("unable to serialize config: {}", err)))?;
    std::fs::write(root.join(CONFIG_NAME), raw)?;
    Ok(())
}
