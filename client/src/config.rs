// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

///
/// The invocation-independent configuration read from `stampede.toml` at the build root. Every
/// section is optional: a bare sentinel file is a valid configuration.
///
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Target aliases usable as positional arguments.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Named cells: cell name to root path, relative to the build root.
    #[serde(default)]
    pub cells: BTreeMap<String, String>,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub stampede: StampedeConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Maintain `last/<target-basename>` links under the output root after successful builds.
    #[serde(default)]
    pub last_links: bool,
    #[serde(default = "ProjectConfig::default_rule_key_seed")]
    pub rule_key_seed: String,
}

impl ProjectConfig {
    fn default_rule_key_seed() -> String {
        "default".to_owned()
    }
}

impl Default for ProjectConfig {
    fn default() -> ProjectConfig {
        ProjectConfig {
            last_links: false,
            rule_key_seed: Self::default_rule_key_seed(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StampedeConfig {
    /// Let the local build complete even if the remote build failed.
    #[serde(default)]
    pub enable_slow_local_build_fallback: bool,
    #[serde(default = "StampedeConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "StampedeConfig::default_remote_deadline_secs")]
    pub remote_deadline_secs: u64,
    #[serde(default = "StampedeConfig::default_max_wait_for_logs_ms")]
    pub max_wait_for_logs_ms: u64,
    #[serde(default = "StampedeConfig::default_minions")]
    pub minions: u32,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tenant: String,
}

impl StampedeConfig {
    fn default_poll_interval_ms() -> u64 {
        500
    }

    fn default_remote_deadline_secs() -> u64 {
        3600
    }

    fn default_max_wait_for_logs_ms() -> u64 {
        5000
    }

    fn default_minions() -> u32 {
        1
    }
}

impl Default for StampedeConfig {
    fn default() -> StampedeConfig {
        StampedeConfig {
            enable_slow_local_build_fallback: false,
            poll_interval_ms: Self::default_poll_interval_ms(),
            remote_deadline_secs: Self::default_remote_deadline_secs(),
            max_wait_for_logs_ms: Self::default_max_wait_for_logs_ms(),
            minions: Self::default_minions(),
            repository: String::new(),
            tenant: String::new(),
        }
    }
}

impl Config {
    ///
    /// Load the configuration from `stampede.toml` under `build_root`. A missing file yields
    /// the defaults; an unparseable one is an error.
    ///
    pub fn load(build_root: &Path) -> Result<Config, String> {
        let path = build_root.join("stampede.toml");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(format!("Failed to read {}: {e}", path.display())),
        };
        toml::from_str(&raw).map_err(|e| format!("Failed to parse {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod config_tests {
    use super::Config;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.aliases.is_empty());
        assert!(!config.stampede.enable_slow_local_build_fallback);
        assert_eq!(config.stampede.poll_interval_ms, 500);
    }

    #[test]
    fn sections_parse() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("stampede.toml"),
            r#"
            [aliases]
            app = "//app:app"

            [cells]
            vendor = "third-party/vendor"

            [project]
            last_links = true

            [stampede]
            enable_slow_local_build_fallback = true
            minions = 8
            repository = "mono"
            tenant = "ci"
            "#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.aliases["app"], "//app:app");
        assert_eq!(config.cells["vendor"], "third-party/vendor");
        assert!(config.project.last_links);
        assert!(config.stampede.enable_slow_local_build_fallback);
        assert_eq!(config.stampede.minions, 8);
        assert_eq!(config.stampede.repository, "mono");
        assert_eq!(config.stampede.tenant, "ci");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("stampede.toml"), "[tpyo]\nx = 1\n").unwrap();
        Config::load(dir.path()).expect_err("unknown section should not parse");
    }
}
