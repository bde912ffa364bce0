use clap::Parser;
use std::io::{self, Read};
use std::str::FromStr;
use tokio::runtime::{Builder, Runtime};

use crate::config::load_net_conf;
use crate::error::{MultusError, Result};
use crate::invoke::ExecInvoker;
use crate::plugin::MultusPlugin;
use crate::types::{parse_cni_args, CmdArgs, CniError, PluginResult, VersionInfo};

/// CNI verbs handled by this plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Add,
    Del,
    Version,
}

impl FromStr for Verb {
    type Err = MultusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Verb::Add),
            "DEL" => Ok(Verb::Del),
            "VERSION" => Ok(Verb::Version),
            other => Err(MultusError::protocol(format!(
                "unknown CNI_COMMAND: {}",
                other
            ))),
        }
    }
}

/// The CNI invocation environment.
///
/// Every field is read from its CNI_* variable; the long flags exist so the
/// environment can also be supplied explicitly.
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "multus",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct CniEnv {
    #[arg(long, env = "CNI_COMMAND")]
    pub command: Option<String>,
    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<String>,
    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,
    #[arg(long, env = "CNI_ARGS")]
    pub args: Option<String>,
    #[arg(long, env = "CNI_PATH")]
    pub path: Option<String>,
}

impl CniEnv {
    /// Read the invocation environment of this process
    pub fn from_env() -> Result<Self> {
        Self::try_parse_from(std::iter::empty::<String>())
            .map_err(|e| MultusError::protocol(format!("invalid CNI environment: {}", e)))
    }

    pub fn verb(&self) -> Result<Verb> {
        let command = required(&self.command, "CNI_COMMAND")?;
        command.parse()
    }

    /// Build command arguments for `verb`, checking the variables it needs
    pub fn cmd_args(&self, verb: Verb, stdin_data: Vec<u8>) -> Result<CmdArgs> {
        let container_id = required(&self.container_id, "CNI_CONTAINERID")?.to_string();
        let ifname = required(&self.ifname, "CNI_IFNAME")?.to_string();
        let path = required(&self.path, "CNI_PATH")?.to_string();
        let netns = match verb {
            Verb::Add => required(&self.netns, "CNI_NETNS")?.to_string(),
            _ => self.netns.clone().unwrap_or_default(),
        };
        let raw_args = self.args.clone().unwrap_or_default();

        Ok(CmdArgs {
            container_id,
            netns,
            ifname,
            args: parse_cni_args(&raw_args),
            raw_args,
            path,
            stdin_data,
        })
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(MultusError::protocol(format!(
            "{} not found in environment",
            name
        ))),
    }
}

fn runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| MultusError::protocol(format!("failed to create Tokio runtime: {}", e)))
}

/// Execute the add command
pub fn cmd_add(args: CmdArgs) -> Result<PluginResult> {
    let conf = load_net_conf(&args.stdin_data)?;
    let plugin = MultusPlugin::new(conf, args, ExecInvoker::new());

    runtime()?.block_on(plugin.add_network())
}

/// Execute the delete command
pub fn cmd_del(args: CmdArgs) -> Result<()> {
    let conf = load_net_conf(&args.stdin_data)?;
    let plugin = MultusPlugin::new(conf, args, ExecInvoker::new());

    runtime()?.block_on(plugin.del_network())
}

/// `cniVersion` of the payload, if it has one, for error reporting
fn sniff_cni_version(stdin_data: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(stdin_data)
        .ok()
        .and_then(|v| v.get("cniVersion")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Dispatch one invocation. Failures come back as the CNI error to report.
pub fn run(env: &CniEnv, mut stdin: impl Read) -> std::result::Result<Option<PluginResult>, CniError> {
    let verb = env.verb().map_err(|e| CniError::from_error(&e, ""))?;

    if verb == Verb::Version {
        let info = serde_json::to_vec(&VersionInfo::default())
            .map_err(|e| CniError::from_error(&MultusError::protocol(e.to_string()), ""))?;
        return Ok(Some(PluginResult::new(info)));
    }

    let mut stdin_data = Vec::new();
    stdin.read_to_end(&mut stdin_data).map_err(|e| {
        CniError::from_error(
            &MultusError::protocol(format!("failed to read from stdin: {}", e)),
            "",
        )
    })?;

    let cni_version = sniff_cni_version(&stdin_data);
    let outcome = env.cmd_args(verb, stdin_data).and_then(|args| match verb {
        Verb::Add => cmd_add(args).map(Some),
        _ => cmd_del(args).map(|()| None),
    });

    outcome.map_err(|e| CniError::from_error(&e, &cni_version))
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> std::result::Result<(), CniError> {
    let env = CniEnv::from_env().map_err(|e| CniError::from_error(&e, ""))?;

    if let Some(result) = run(&env, io::stdin())? {
        result.print().map_err(|e| {
            CniError::from_error(
                &MultusError::protocol(format!("failed to write result: {}", e)),
                "",
            )
        })?;
    }

    Ok(())
}
