use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::error::MultusError;

/// CNI versions this plugin can speak
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1"];

/// CNI command arguments
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path (may be empty on DEL)
    pub netns: String,
    /// Interface name requested by the runtime
    pub ifname: String,
    /// Parsed CNI_ARGS
    pub args: HashMap<String, String>,
    /// CNI_ARGS exactly as received, forwarded to delegates
    pub raw_args: String,
    /// Plugin search path (colon separated)
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    /// Directories listed in CNI_PATH, in search order
    pub fn path_dirs(&self) -> Vec<PathBuf> {
        self.path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    /// `namespace/name` of the pod, when the runtime passed it
    pub fn pod_ref(&self) -> Option<String> {
        let name = self.args.get("K8S_POD_NAME")?;
        let namespace = self.args.get("K8S_POD_NAMESPACE").map_or("", String::as_str);
        Some(format!("{}/{}", namespace, name))
    }
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Result of a successful ADD, written verbatim to stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginResult {
    pub raw: Vec<u8>,
}

impl PluginResult {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// Minimal result reported when no delegate is flagged master
    pub fn empty(cni_version: &str) -> Self {
        let raw = serde_json::json!({ "cniVersion": cni_version }).to_string();
        Self::new(raw.into_bytes())
    }

    /// Parse the raw bytes as JSON
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.raw)
    }

    /// Print result to stdout
    pub fn print(&self) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(&self.raw)?;
        stdout.flush()
    }
}

/// CNI error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniError {
    #[serde(rename = "cniVersion", default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniError {
    pub fn from_error(err: &MultusError, cni_version: &str) -> Self {
        let details = match err {
            MultusError::Persistence { source, .. } => source.to_string(),
            _ => String::new(),
        };

        Self {
            cni_version: cni_version.to_string(),
            code: err.code(),
            msg: err.to_string(),
            details,
        }
    }

    /// Print error as JSON to stdout
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

/// Reply to the VERSION command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1].to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}
