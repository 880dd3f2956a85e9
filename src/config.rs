//! Declarative configuration
//!
//! Process settings and per-type behavior read from YAML:
//!
//! ```yaml
//! process:
//!   sweep_interval: 60s
//!   shutdown_task_timeout: 1s
//!   replication_buffer_ttl: 30s
//!   distributed_default_expiry: 12h
//! types:
//!   - name: player
//!     ttl: 5m
//!     preload: true
//!   - name: guild
//!     replicate_to_backing: false
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::memory::DEFAULT_DISTRIBUTED_EXPIRY;
use crate::domain::ports::EntityType;
use crate::error::{Error, Result};
use crate::pipeline::registry::TypeConfig;
use crate::pipeline::replication::DEFAULT_REPLICATION_BUFFER_TTL;
use crate::pipeline::scheduler::DEFAULT_SHUTDOWN_TASK_TIMEOUT;
use crate::pipeline::sweeper::{DEFAULT_SWEEP_CONCURRENCY, DEFAULT_SWEEP_INTERVAL};

// =============================================================================
// Resolved settings
// =============================================================================

/// Process-wide settings with durations resolved
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSettings {
    /// Pause between eviction sweeps
    pub sweep_interval: Duration,
    /// Bounded wait per outstanding load on shutdown
    pub shutdown_task_timeout: Duration,
    /// Lifetime of a replication buffer slot
    pub replication_buffer_ttl: Duration,
    /// Distributed cache expiry for types that declare none
    pub distributed_default_expiry: Duration,
    /// Entities written through concurrently by one sweep
    pub sweep_concurrency: usize,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown_task_timeout: DEFAULT_SHUTDOWN_TASK_TIMEOUT,
            replication_buffer_ttl: DEFAULT_REPLICATION_BUFFER_TTL,
            distributed_default_expiry: DEFAULT_DISTRIBUTED_EXPIRY,
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }
}

// =============================================================================
// File format
// =============================================================================

/// Top-level configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub process: ProcessSection,
    pub types: Vec<TypeSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    pub sweep_interval: String,
    pub shutdown_task_timeout: String,
    pub replication_buffer_ttl: String,
    pub distributed_default_expiry: String,
    pub sweep_concurrency: usize,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            sweep_interval: "60s".to_string(),
            shutdown_task_timeout: "1s".to_string(),
            replication_buffer_ttl: "30s".to_string(),
            distributed_default_expiry: "12h".to_string(),
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Settings of one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSection {
    pub name: String,
    /// Absent: never swept
    #[serde(default)]
    pub ttl: Option<String>,
    #[serde(default = "default_true")]
    pub replicate_to_backing: bool,
    #[serde(default = "default_true")]
    pub sweep_to_distributed: bool,
    #[serde(default = "default_true")]
    pub auto_save: bool,
    #[serde(default)]
    pub preload: bool,
    #[serde(default)]
    pub distributed_expiry: Option<String>,
}

impl TypeSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: None,
            replicate_to_backing: true,
            sweep_to_distributed: true,
            auto_save: true,
            preload: false,
            distributed_expiry: None,
        }
    }

    pub fn to_type_config(&self) -> Result<TypeConfig> {
        Ok(TypeConfig {
            ttl: self.ttl.as_deref().map(parse_duration).transpose()?,
            replicate_to_backing: self.replicate_to_backing,
            sweep_to_distributed: self.sweep_to_distributed,
            auto_save: self.auto_save,
            preload: self.preload,
            distributed_expiry: self
                .distributed_expiry
                .as_deref()
                .map(parse_duration)
                .transpose()?,
        })
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Resolve process settings.
    pub fn process_settings(&self) -> Result<ProcessSettings> {
        let p = &self.process;
        let settings = ProcessSettings {
            sweep_interval: parse_duration(&p.sweep_interval)?,
            shutdown_task_timeout: parse_duration(&p.shutdown_task_timeout)?,
            replication_buffer_ttl: parse_duration(&p.replication_buffer_ttl)?,
            distributed_default_expiry: parse_duration(&p.distributed_default_expiry)?,
            sweep_concurrency: p.sweep_concurrency,
        };
        if settings.sweep_interval.is_zero() {
            return Err(Error::Config("sweep_interval must be greater than 0".into()));
        }
        if settings.sweep_concurrency == 0 {
            return Err(Error::Config("sweep_concurrency must be greater than 0".into()));
        }
        Ok(settings)
    }

    /// Resolve every type section, rejecting duplicates.
    pub fn type_configs(&self) -> Result<Vec<(EntityType, TypeConfig)>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.types.len());
        for section in &self.types {
            let name = section.name.trim();
            if name.is_empty() {
                return Err(Error::Config("type name must not be empty".into()));
            }
            if !seen.insert(name.to_string()) {
                return Err(Error::Config(format!("type '{}' configured twice", name)));
            }
            let config = section
                .to_type_config()
                .map_err(|e| Error::Config(format!("type '{}': {}", name, e)))?;
            resolved.push((EntityType::new(name), config));
        }
        Ok(resolved)
    }
}

// =============================================================================
// Duration parsing
// =============================================================================

/// Parse a duration string like "30s", "5m", "1h30m", "2d" or "500ms".
///
/// A trailing bare number counts as seconds. Zero is allowed.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    let take_number = |buf: &mut String| -> Result<u64> {
        let num = buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        buf.clear();
        Ok(num)
    };

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num = take_number(&mut num_buf)?;
        let multiplier: u64 = match c {
            'm' | 'M' if matches!(chars.peek(), Some('s') | Some('S')) => {
                chars.next();
                1
            }
            'd' | 'D' => 86_400_000,
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = num
            .checked_mul(multiplier)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    // Trailing number without a unit: seconds
    if !num_buf.is_empty() {
        let num = take_number(&mut num_buf)?;
        total_ms = num
            .checked_mul(1_000)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    Ok(Duration::from_millis(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_duration_combined_and_bare() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("1m30s500ms").unwrap(), Duration::from_millis(90_500));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(matches!(parse_duration(""), Err(Error::DurationParse(_))));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("99999999999999999999d").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.process_settings().unwrap(), ProcessSettings::default());
        assert!(config.type_configs().unwrap().is_empty());
    }

    #[test]
    fn test_yaml_types() {
        let yaml = r#"
process:
  sweep_interval: 10s
  shutdown_task_timeout: 500ms
types:
  - name: player
    ttl: 5m
    preload: true
    distributed_expiry: 1h
  - name: guild
    replicate_to_backing: false
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        let settings = config.process_settings().unwrap();
        assert_eq!(settings.sweep_interval, Duration::from_secs(10));
        assert_eq!(settings.shutdown_task_timeout, Duration::from_millis(500));
        assert_eq!(settings.replication_buffer_ttl, Duration::from_secs(30));

        let types = config.type_configs().unwrap();
        assert_eq!(types.len(), 2);
        let (name, player) = &types[0];
        assert_eq!(name.as_str(), "player");
        assert_eq!(player.ttl, Some(Duration::from_secs(300)));
        assert!(player.preload);
        assert_eq!(player.distributed_expiry, Some(Duration::from_secs(3_600)));

        let (_, guild) = &types[1];
        assert!(guild.ttl.is_none());
        assert!(!guild.replicate_to_backing);
        assert!(guild.auto_save);
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let config = PipelineConfig {
            types: vec![TypeSection::new("player"), TypeSection::new("player")],
            ..Default::default()
        };
        assert!(matches!(config.type_configs(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_type_duration_names_the_type() {
        let mut section = TypeSection::new("player");
        section.ttl = Some("soon".into());
        let config = PipelineConfig {
            types: vec![section],
            ..Default::default()
        };
        let err = config.type_configs().unwrap_err().to_string();
        assert!(err.contains("player"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = PipelineConfig {
            types: vec![TypeSection::new("player")],
            ..Default::default()
        };
        let yaml = config.to_yaml().unwrap();
        assert_eq!(PipelineConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut config = PipelineConfig::default();
        config.process.sweep_interval = "0s".into();
        assert!(config.process_settings().is_err());
    }
}
