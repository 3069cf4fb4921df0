//! Simulation configuration files
//!
//! A configuration file is TOML with two optional tables:
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [scenario]
//! senders = 8
//!
//! [scenario.buffer]
//! kmin_bytes = 10000
//! ```
//!
//! The `[scenario]` table is layered over the defaults of the scenario being
//! run, so a file only lists what it changes.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use qbb_logging::LogConfig;

use crate::scenarios::{ScenarioConfig, ScenarioKind};

/// Parsed configuration file, before scenario defaults are applied
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationFile {
    pub logging: LogConfig,
    /// Overrides of the scenario defaults
    pub scenario: toml::Table,
}

impl SimulationFile {
    /// Read and parse a configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults of `kind` with this file's overrides applied
    pub fn scenario_config(&self, kind: ScenarioKind) -> anyhow::Result<ScenarioConfig> {
        let defaults = ScenarioConfig::for_kind(kind);
        let mut merged = toml::Table::try_from(&defaults)
            .context("Failed to serialize scenario defaults")?;
        merge_tables(&mut merged, self.scenario.clone());
        let config: ScenarioConfig = merged
            .try_into()
            .with_context(|| format!("Invalid [scenario] table for {kind}"))?;
        config.nic.validate().context("Invalid [scenario.nic]")?;
        config.switch.validate().context("Invalid [scenario.switch]")?;
        config.buffer.validate().context("Invalid [scenario.buffer]")?;
        Ok(config)
    }
}

/// Overlay `overlay` onto `base`, descending into nested tables
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Default configuration of `kind` as a TOML document
pub fn default_config_toml(kind: ScenarioKind) -> anyhow::Result<String> {
    #[derive(Serialize)]
    struct Document {
        logging: LogConfig,
        scenario: ScenarioConfig,
    }
    let document = Document {
        logging: LogConfig::default(),
        scenario: ScenarioConfig::for_kind(kind),
    };
    toml::to_string_pretty(&document).context("Failed to render default config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbb_core::DataRate;

    #[test]
    fn test_empty_file_keeps_scenario_defaults() {
        let file = SimulationFile::parse("").unwrap();
        for kind in ScenarioKind::ALL {
            assert_eq!(
                file.scenario_config(kind).unwrap(),
                ScenarioConfig::for_kind(kind)
            );
        }
    }

    #[test]
    fn test_overrides_layer_over_defaults() {
        let file = SimulationFile::parse(
            r#"
            [logging]
            level = "debug"

            [scenario]
            senders = 8
            link_rate = "100Gb/s"

            [scenario.buffer]
            kmin_bytes = 10000
            "#,
        )
        .unwrap();
        assert_eq!(file.logging.level, "debug");

        let config = file.scenario_config(ScenarioKind::Incast).unwrap();
        let defaults = ScenarioConfig::for_kind(ScenarioKind::Incast);
        assert_eq!(config.senders, 8);
        assert_eq!(config.link_rate, DataRate::from_gbps(100));
        assert_eq!(config.buffer.kmin_bytes, 10_000);
        // Untouched nested fields keep the incast preset
        assert_eq!(config.buffer.kmax_bytes, defaults.buffer.kmax_bytes);
        assert!(config.nic.qcn_enabled);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let file = SimulationFile::parse(
            r#"
            [scenario.nic]
            gain = 0.0
            "#,
        )
        .unwrap();
        assert!(file.scenario_config(ScenarioKind::PfcPause).is_err());
    }

    #[test]
    fn test_default_document_parses_back() {
        let text = default_config_toml(ScenarioKind::Lossy).unwrap();
        let file = SimulationFile::parse(&text).unwrap();
        assert_eq!(
            file.scenario_config(ScenarioKind::Lossy).unwrap(),
            ScenarioConfig::for_kind(ScenarioKind::Lossy)
        );
    }
}
