//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// Daemon bootstrap configuration.
///
/// The file carries the daemon's own settings plus the driver service
/// config and the initial equipment entries, which the daemon replays to
/// the agent as config-store events on startup.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub logging: Logging,
    pub database_path: String,
    /// Main driver service configuration (see the drover-core config
    /// schema).
    pub driver: Value,
    /// Initial equipment configurations keyed by topic
    /// (`devices/<path>`).
    pub equipment: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub stdout: LoggingStdout,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingStdout {
    pub enabled: bool,
    pub style: LoggingFmtStyle,
    pub colors: bool,
    pub show_source: bool,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingFmtStyle {
    Compact,
    Full,
    Json,
    Pretty,
}

// ===== impl Config =====

impl Config {
    pub fn load(path: Option<&str>) -> Config {
        match path {
            Some(path) => {
                let contents = match std::fs::read_to_string(path) {
                    Ok(contents) => contents,
                    Err(error) => {
                        eprintln!(
                            "failed to read configuration file {path}: {error}"
                        );
                        std::process::exit(1);
                    }
                };
                match serde_json::from_str(&contents) {
                    Ok(config) => config,
                    Err(error) => {
                        eprintln!(
                            "failed to parse configuration file {path}: \
                             {error}"
                        );
                        std::process::exit(1);
                    }
                }
            }
            None => Config::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            logging: Logging::default(),
            database_path: "drover.db".to_owned(),
            driver: Value::Object(Default::default()),
            equipment: BTreeMap::new(),
        }
    }
}

impl Default for Logging {
    fn default() -> Logging {
        Logging {
            stdout: LoggingStdout::default(),
        }
    }
}

impl Default for LoggingStdout {
    fn default() -> LoggingStdout {
        LoggingStdout {
            enabled: true,
            style: LoggingFmtStyle::Full,
            colors: true,
            show_source: false,
        }
    }
}

impl Default for LoggingFmtStyle {
    fn default() -> LoggingFmtStyle {
        LoggingFmtStyle::Full
    }
}
