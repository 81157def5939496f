use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel file asserting that a directory is managed by flotilla.
pub const MARKER_FILE: &str = ".flotilla";
pub const SECRETS_DIR: &str = "secrets";
pub const METADATA_FILE: &str = "metadata.log";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceName(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("instance name must be a fully-qualified domain name")]
    NotQualified,
    #[error("invalid domain label: {0}")]
    InvalidLabel(String),
    #[error("instance name is too long")]
    TooLong,
}

fn label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("regex compile"))
}

impl InstanceName {
    pub fn parse(input: &str) -> Result<Self, NameError> {
        let input = input.trim().trim_end_matches('.').to_ascii_lowercase();
        if input.len() > 253 {
            return Err(NameError::TooLong);
        }
        let labels: Vec<&str> = input.split('.').collect();
        if labels.len() < 2 {
            return Err(NameError::NotQualified);
        }
        for label in labels {
            if label.is_empty() || !label_regex().is_match(label) {
                return Err(NameError::InvalidLabel(label.to_string()));
            }
        }
        Ok(Self(input))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compose project / stack name derived from the domain.
    pub fn project(&self) -> String {
        self.0.replace('.', "_")
    }

    pub fn www(&self) -> String {
        format!("www.{}", self.0)
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    Compose,
    Stack,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compose => "compose",
            Self::Stack => "stack",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compose" => Ok(Self::Compose),
            "stack" => Ok(Self::Stack),
            other => Err(format!(
                "invalid deployment mode: {other}, must be compose/stack"
            )),
        }
    }
}

/// Live run status, computed on demand and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Up,
    Degraded,
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    /// Accepting connections, even if the application is still starting.
    pub fn is_online(&self) -> bool {
        !matches!(self, Self::Down)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance directory under the fleet root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: InstanceName,
    pub directory: PathBuf,
    config_file_name: String,
}

impl Instance {
    pub fn new(fleet_root: &Path, name: InstanceName, config_file_name: &str) -> Self {
        Self {
            directory: fleet_root.join(name.as_str()),
            name,
            config_file_name: config_file_name.to_string(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.directory.join(&self.config_file_name)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.directory.join(MARKER_FILE)
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.directory.join(SECRETS_DIR)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.directory.join(METADATA_FILE)
    }

    pub fn exists(&self) -> bool {
        self.directory.is_dir()
    }

    pub fn is_managed(&self) -> bool {
        self.marker_path().is_file()
    }

    pub fn project(&self) -> String {
        self.name.project()
    }
}
