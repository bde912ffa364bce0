//! Delegation engine.
//!
//! ADD persists the delegate list, then runs the master delegate before all
//! others so the primary interface exists first. DEL consumes the persisted
//! list and tears delegates down in their original order. Neither verb rolls
//! back on failure; the runtime is expected to follow a failed ADD with DEL.

mod namer;

pub use namer::{InterfaceNamer, IFNAME_PREFIX};

use tracing::{debug, info, warn};

use crate::config::{Delegate, NetConf};
use crate::error::{MultusError, Result};
use crate::invoke::{DelegateInvoker, InvokeRequest};
use crate::store::DelegateStore;
use crate::types::{CmdArgs, PluginResult};

/// The two ADD passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Master,
    Others,
}

impl Pass {
    /// Whether `delegate` is handled in this pass. A delegate that does not
    /// belong to the pass is simply skipped.
    fn admits(self, delegate: &Delegate) -> bool {
        match self {
            Pass::Master => delegate.is_master(),
            Pass::Others => !delegate.is_master(),
        }
    }
}

/// Multus plugin implementation
pub struct MultusPlugin<I> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    /// Where the delegate list is kept between ADD and DEL
    store: DelegateStore,
    /// Runs the delegate plugins
    invoker: I,
}

impl<I: DelegateInvoker> MultusPlugin<I> {
    /// Create a new plugin; delegates are stored under the config's `cniDir`
    pub fn new(config: NetConf, args: CmdArgs, invoker: I) -> Self {
        let store = DelegateStore::new(config.cni_dir.clone());
        Self {
            config,
            args,
            store,
            invoker,
        }
    }

    pub fn config(&self) -> &NetConf {
        &self.config
    }

    /// Attach every delegate, returning the master's result
    pub async fn add_network(&self) -> Result<PluginResult> {
        info!(
            "ADD container {} ({}) with {} delegates",
            self.args.container_id,
            self.pod_ref(),
            self.config.delegates.len()
        );

        self.ensure_single_master()?;
        self.store
            .save(&self.args.container_id, &self.config.delegates)?;

        let mut namer = InterfaceNamer::new();
        let mut result = None;

        for pass in [Pass::Master, Pass::Others] {
            for delegate in self.config.delegates.iter().filter(|d| pass.admits(d)) {
                let ifname = match pass {
                    Pass::Master => self.args.ifname.clone(),
                    Pass::Others => namer.next_name(),
                };

                let raw = self.delegate_add(delegate, ifname).await?;
                if pass == Pass::Master {
                    result = Some(PluginResult::new(raw));
                }
            }
        }

        info!("ADD container {} complete", self.args.container_id);
        Ok(result.unwrap_or_else(|| PluginResult::empty(&self.config.cni_version)))
    }

    /// Detach every persisted delegate in original order.
    ///
    /// A missing delegate set means another DEL already ran (or ADD never
    /// persisted one) and is reported as success.
    pub async fn del_network(&self) -> Result<()> {
        info!(
            "DEL container {} ({})",
            self.args.container_id,
            self.pod_ref()
        );

        let delegates = match self.store.load(&self.args.container_id) {
            Ok(delegates) => delegates,
            Err(e) if e.is_not_found() => {
                warn!(
                    "No delegates stored for container {}, nothing to delete",
                    self.args.container_id
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut namer = InterfaceNamer::new();
        for delegate in &delegates {
            let ifname = if delegate.is_master() {
                self.args.ifname.clone()
            } else {
                namer.next_name()
            };
            self.delegate_del(delegate, ifname).await?;
        }

        info!(
            "DEL container {} removed {} delegates",
            self.args.container_id,
            delegates.len()
        );
        Ok(())
    }

    async fn delegate_add(&self, delegate: &Delegate, ifname: String) -> Result<Vec<u8>> {
        let req = self.request(delegate, ifname)?;
        debug!("ADD delegate {} as {}", delegate.plugin_type, req.ifname);
        self.invoker.add(&req).await
    }

    async fn delegate_del(&self, delegate: &Delegate, ifname: String) -> Result<()> {
        let req = self.request(delegate, ifname)?;
        debug!("DEL delegate {} as {}", delegate.plugin_type, req.ifname);
        self.invoker.del(&req).await
    }

    fn request<'a>(&'a self, delegate: &'a Delegate, ifname: String) -> Result<InvokeRequest<'a>> {
        if ifname.is_empty() {
            return Err(MultusError::protocol(format!(
                "no interface name for delegate {}",
                delegate.plugin_type
            )));
        }

        Ok(InvokeRequest {
            plugin: &delegate.plugin_type,
            payload: delegate.to_payload(&self.config.cni_version)?,
            ifname,
            args: &self.args,
        })
    }

    fn ensure_single_master(&self) -> Result<()> {
        let masters = self.config.delegates.iter().filter(|d| d.is_master()).count();
        if masters > 1 {
            return Err(MultusError::config(
                "only one delegate can have 'masterplugin'",
            ));
        }
        Ok(())
    }

    fn pod_ref(&self) -> String {
        self.args.pod_ref().unwrap_or_else(|| "-".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    /// Records calls and optionally fails one plugin
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String, String)>>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn record(&self, verb: &str, req: &InvokeRequest<'_>) -> Result<()> {
            self.calls.lock().unwrap().push((
                verb.to_string(),
                req.plugin.to_string(),
                req.ifname.clone(),
            ));
            if self.fail_on == Some(req.plugin) {
                return Err(MultusError::Delegate {
                    plugin: req.plugin.to_string(),
                    code: Some(11),
                    msg: "boom".to_string(),
                });
            }
            Ok(())
        }

        fn calls(&self) -> Vec<(String, String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DelegateInvoker for &Recorder {
        async fn add(&self, req: &InvokeRequest<'_>) -> Result<Vec<u8>> {
            self.record("ADD", req)?;
            Ok(format!(r#"{{"cniVersion":"0.3.1","from":"{}"}}"#, req.plugin).into_bytes())
        }

        async fn del(&self, req: &InvokeRequest<'_>) -> Result<()> {
            self.record("DEL", req)
        }
    }

    fn plugin<'a>(dir: &Path, json: &str, recorder: &'a Recorder) -> MultusPlugin<&'a Recorder> {
        let mut conf = NetConf::parse(json.as_bytes()).unwrap();
        conf.cni_dir = dir.to_path_buf();
        let args = CmdArgs {
            container_id: "c1".to_string(),
            netns: "/var/run/netns/c1".to_string(),
            ifname: "eth0".to_string(),
            ..Default::default()
        };
        MultusPlugin::new(conf, args, recorder)
    }

    fn call(verb: &str, plugin: &str, ifname: &str) -> (String, String, String) {
        (verb.to_string(), plugin.to_string(), ifname.to_string())
    }

    #[tokio::test]
    async fn test_master_in_middle_runs_first() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let plugin = plugin(
            tmp.path(),
            r#"{"delegates":[{"type":"a"},{"type":"b","masterplugin":true},{"type":"c"}]}"#,
            &recorder,
        );

        let result = plugin.add_network().await.unwrap();
        assert_eq!(result.json().unwrap()["from"], "b");
        assert_eq!(
            recorder.calls(),
            vec![call("ADD", "b", "eth0"), call("ADD", "a", "net0"), call("ADD", "c", "net1")]
        );
    }

    #[tokio::test]
    async fn test_add_failure_stops_without_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder {
            fail_on: Some("b"),
            ..Default::default()
        };
        let plugin = plugin(
            tmp.path(),
            r#"{"delegates":[{"type":"m","masterplugin":true},{"type":"a"},{"type":"b"},{"type":"c"}]}"#,
            &recorder,
        );

        let err = plugin.add_network().await.unwrap_err();
        assert_eq!(err.code(), 11);
        assert_eq!(
            recorder.calls(),
            vec![call("ADD", "m", "eth0"), call("ADD", "a", "net0"), call("ADD", "b", "net1")]
        );
        // The set stays behind for the runtime's follow-up DEL
        assert!(tmp.path().join("c1").exists());
    }

    #[tokio::test]
    async fn test_no_master_yields_minimal_result() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let plugin = plugin(
            tmp.path(),
            r#"{"cniVersion":"0.3.0","delegates":[{"type":"a"}]}"#,
            &recorder,
        );

        let result = plugin.add_network().await.unwrap();
        assert_eq!(result.json().unwrap(), serde_json::json!({"cniVersion": "0.3.0"}));
        assert_eq!(recorder.calls(), vec![call("ADD", "a", "net0")]);
    }

    #[tokio::test]
    async fn test_duplicate_master_has_no_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let mut plugin = plugin(tmp.path(), r#"{"delegates":[{"type":"a"}]}"#, &recorder);
        plugin.config.delegates = vec![
            Delegate::new("a", Some(true)),
            Delegate::new("b", Some(true)),
        ];

        let err = plugin.add_network().await.unwrap_err();
        assert!(matches!(err, MultusError::Config(_)));
        assert!(recorder.calls().is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_del_uses_add_naming_in_list_order() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let plugin = plugin(
            tmp.path(),
            r#"{"delegates":[{"type":"a"},{"type":"b","masterplugin":true},{"type":"c"}]}"#,
            &recorder,
        );

        plugin.add_network().await.unwrap();
        recorder.calls.lock().unwrap().clear();

        plugin.del_network().await.unwrap();
        assert_eq!(
            recorder.calls(),
            vec![call("DEL", "a", "net0"), call("DEL", "b", "eth0"), call("DEL", "c", "net1")]
        );

        recorder.calls.lock().unwrap().clear();
        plugin.del_network().await.unwrap();
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_del_stops_at_first_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder {
            fail_on: Some("b"),
            ..Default::default()
        };
        let plugin = plugin(
            tmp.path(),
            r#"{"delegates":[{"type":"a","masterplugin":true},{"type":"b"},{"type":"c"}]}"#,
            &recorder,
        );
        plugin
            .store
            .save("c1", &plugin.config.delegates)
            .unwrap();

        assert!(plugin.del_network().await.is_err());
        assert_eq!(
            recorder.calls(),
            vec![call("DEL", "a", "eth0"), call("DEL", "b", "net0")]
        );
    }

    #[tokio::test]
    async fn test_empty_ifname_is_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let mut plugin = plugin(
            tmp.path(),
            r#"{"delegates":[{"type":"a","masterplugin":true}]}"#,
            &recorder,
        );
        plugin.args.ifname.clear();

        let err = plugin.add_network().await.unwrap_err();
        assert!(matches!(err, MultusError::Protocol(_)));
    }
}
