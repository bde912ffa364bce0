use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::error::{MultusError, Result};

/// Directory holding persisted delegate sets when `cniDir` is unset
pub const DEFAULT_CNI_DIR: &str = "/var/lib/cni/multus";

/// CNI version assumed when the configuration does not declare one
pub const DEFAULT_CNI_VERSION: &str = "0.3.1";

/// Configuration of one downstream plugin.
///
/// `type` and `masterplugin` are lifted out and checked once at parse time.
/// Every other key lands in `extra` and is written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Delegate {
    /// Name of the plugin binary to execute
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Whether this delegate's result is the one reported to the runtime
    #[serde(rename = "masterplugin", skip_serializing_if = "Option::is_none")]
    pub master_plugin: Option<bool>,
    /// Pass-through fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Delegate {
    /// Create a delegate with no pass-through fields
    pub fn new(plugin_type: &str, master_plugin: Option<bool>) -> Self {
        Self {
            plugin_type: plugin_type.to_string(),
            master_plugin,
            extra: Map::new(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.master_plugin == Some(true)
    }

    /// Encode the configuration handed to the plugin on stdin. A missing
    /// `cniVersion` is inherited from the parent network.
    pub fn to_payload(&self, cni_version: &str) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| MultusError::config(format!("failed to encode delegate: {}", e)))?;

        if let Value::Object(map) = &mut value {
            map.entry("cniVersion")
                .or_insert_with(|| Value::String(cni_version.to_string()));
        }

        serde_json::to_vec(&value)
            .map_err(|e| MultusError::config(format!("failed to encode delegate: {}", e)))
    }
}

impl TryFrom<Value> for Delegate {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let Value::Object(mut extra) = value else {
            return Err("delegate must be a JSON object".to_string());
        };

        let plugin_type = match extra.remove("type") {
            Some(Value::String(t)) => t,
            _ => return Err("delegate must have the field 'type'".to_string()),
        };

        let master_plugin = match extra.remove("masterplugin") {
            None => None,
            Some(Value::Bool(b)) => Some(b),
            Some(_) => return Err("delegate field 'masterplugin' must be a bool".to_string()),
        };

        Ok(Self {
            plugin_type,
            master_plugin,
            extra,
        })
    }
}

/// Validate raw delegate objects in a single left-to-right pass.
///
/// Whether a master has already been accepted is folded through the pass, so
/// nothing survives between calls.
pub fn check_delegates(raw: Vec<Value>) -> Result<Vec<Delegate>> {
    let (delegates, _) = raw.into_iter().enumerate().try_fold(
        (Vec::new(), false),
        |(mut delegates, master_claimed), (idx, value)| -> Result<(Vec<Delegate>, bool)> {
            let delegate = Delegate::try_from(value)
                .map_err(|e| MultusError::config(format!("delegate {}: {}", idx, e)))?;

            if delegate.is_master() && master_claimed {
                return Err(MultusError::config(format!(
                    "delegate {} ({}): only one delegate can have 'masterplugin'",
                    idx, delegate.plugin_type
                )));
            }

            let master_claimed = master_claimed || delegate.is_master();
            delegates.push(delegate);
            Ok((delegates, master_claimed))
        },
    )?;

    Ok(delegates)
}

/// Wire shape of the configuration before delegates are checked
#[derive(Deserialize)]
struct RawNetConf {
    #[serde(rename = "cniVersion")]
    cni_version: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    plugin_type: String,
    #[serde(rename = "cniDir")]
    cni_dir: Option<PathBuf>,
    delegates: Option<Vec<Value>>,
}

/// Network configuration for the multus meta-plugin
#[derive(Debug, Clone, PartialEq)]
pub struct NetConf {
    /// CNI specification version
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin (normally "multus")
    pub plugin_type: String,
    /// Where delegate sets are persisted between ADD and DEL
    pub cni_dir: PathBuf,
    /// Ordered, validated delegates
    pub delegates: Vec<Delegate>,
}

impl NetConf {
    /// Parse and validate NetConf from bytes. Has no side effects.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: RawNetConf = serde_json::from_slice(bytes).map_err(|e| {
            MultusError::config(format!("failed to parse network configuration: {}", e))
        })?;

        let delegates = match raw.delegates {
            Some(delegates) if !delegates.is_empty() => check_delegates(delegates)?,
            _ => return Err(MultusError::config("delegates is mandatory")),
        };

        Ok(Self {
            cni_version: raw
                .cni_version
                .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string()),
            name: raw.name,
            plugin_type: raw.plugin_type,
            cni_dir: raw
                .cni_dir
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CNI_DIR)),
            delegates,
        })
    }

    /// The delegate whose result is reported, if any
    pub fn master(&self) -> Option<&Delegate> {
        self.delegates.iter().find(|d| d.is_master())
    }
}

/// Load the invocation's configuration payload
pub fn load_net_conf(bytes: &[u8]) -> Result<NetConf> {
    NetConf::parse(bytes)
}
