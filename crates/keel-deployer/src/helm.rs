//! Helm provider: releases managed through the `helm` binary.
//!
//! Values are always piped on stdin, never placed on the command line.

use async_trait::async_trait;
use keel_core::provider::{ApplyRequest, Observed, Readiness, ResourceLocator, ResourceProvider};
use keel_core::value::PropertyValue;
use keel_core::{ResourceType, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::readiness::helm_readiness;

/// Declared properties of a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseSpec {
    pub chart: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub skip_crds: bool,
    #[serde(default)]
    pub values: Value,
}

impl ReleaseSpec {
    pub fn from_properties(locator: &ResourceLocator, properties: &Value) -> DeployResult<Self> {
        serde_json::from_value(properties.clone()).map_err(|e| DeployError::Parse {
            what: format!("release {}", locator.remote_name),
            message: e.to_string(),
        })
    }
}

/// Captured output of a helm invocation.
#[derive(Debug)]
struct HelmOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Runs the helm binary.
pub struct HelmProvider {
    helm_bin: String,
    kube_context: Option<String>,
}

impl Default for HelmProvider {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl HelmProvider {
    pub fn new(helm_bin: impl Into<String>) -> Self {
        Self {
            helm_bin: helm_bin.into(),
            kube_context: None,
        }
    }

    pub fn with_kube_context(mut self, context: Option<String>) -> Self {
        self.kube_context = context;
        self
    }

    fn namespace(locator: &ResourceLocator) -> &str {
        locator.namespace.as_deref().unwrap_or("default")
    }

    /// Arguments for `helm upgrade --install`; values come from stdin.
    pub fn upgrade_args(&self, locator: &ResourceLocator, spec: &ReleaseSpec) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            locator.remote_name.clone(),
            spec.chart.clone(),
            "--namespace".to_string(),
            Self::namespace(locator).to_string(),
            "--values".to_string(),
            "-".to_string(),
        ];
        if let Some(repo) = &spec.repo {
            args.push("--repo".to_string());
            args.push(repo.clone());
        }
        if let Some(version) = &spec.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        if spec.skip_crds {
            args.push("--skip-crds".to_string());
        }
        self.push_context(&mut args);
        args
    }

    fn release_args(&self, command: &[&str], locator: &ResourceLocator, json: bool) -> Vec<String> {
        let mut args: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        args.push(locator.remote_name.clone());
        args.push("--namespace".to_string());
        args.push(Self::namespace(locator).to_string());
        if json {
            args.push("--output".to_string());
            args.push("json".to_string());
        }
        self.push_context(&mut args);
        args
    }

    fn push_context(&self, args: &mut Vec<String>) {
        if let Some(context) = &self.kube_context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
    }

    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> DeployResult<HelmOutput> {
        debug!(helm = %self.helm_bin, command = %args.first().map(String::as_str).unwrap_or(""), "Running helm");
        let mut child = Command::new(&self.helm_bin)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(HelmOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn failed(command: &str, output: &HelmOutput) -> DeployError {
        let combined = format!("{}\n{}", output.stdout.trim(), output.stderr.trim());
        DeployError::Helm {
            command: command.to_string(),
            output: combined.trim().to_string(),
        }
    }

    fn is_release_missing(output: &HelmOutput) -> bool {
        output.stderr.contains("release: not found")
    }

    /// Observe a release: status plus user-supplied values.
    async fn observe(&self, locator: &ResourceLocator) -> DeployResult<Option<Observed>> {
        let status = self
            .run(&self.release_args(&["status"], locator, true), None)
            .await?;
        if !status.success {
            if Self::is_release_missing(&status) {
                return Ok(None);
            }
            return Err(Self::failed("status", &status));
        }
        let status: Value = parse_json("helm status", &status.stdout)?;

        let values = self
            .run(&self.release_args(&["get", "values"], locator, true), None)
            .await?;
        if !values.success {
            return Err(Self::failed("get values", &values));
        }
        let values: Value = parse_json("helm get values", &values.stdout)?;

        let object = release_object(&status, values);
        // User-supplied values may hold secrets and are not exposed as outputs.
        let mut outputs = object.clone();
        if let Some(map) = outputs.as_object_mut() {
            map.remove("values");
        }
        Ok(Some(Observed {
            object,
            outputs: PropertyValue::from_json(outputs),
        }))
    }
}

fn parse_json(what: &str, text: &str) -> DeployResult<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(trimmed).map_err(|e| DeployError::Parse {
        what: what.to_string(),
        message: e.to_string(),
    })
}

/// The observed shape of a release. Only `values` and `version` overlap
/// with declared properties, so drift is limited to those.
pub fn release_object(status: &Value, values: Value) -> Value {
    let info = status.get("info").cloned().unwrap_or(Value::Null);
    let mut object = json!({
        "name": status.get("name").cloned().unwrap_or(Value::Null),
        "namespace": status.get("namespace").cloned().unwrap_or(Value::Null),
        "revision": status.get("version").cloned().unwrap_or(Value::Null),
        "info": {
            "status": info.get("status").cloned().unwrap_or(Value::Null),
            "description": info.get("description").cloned().unwrap_or(Value::Null),
        },
        "values": values,
    });
    if let Some(version) = status.pointer("/chart/metadata/version") {
        object["version"] = version.clone();
    }
    if let Some(app_version) = status.pointer("/chart/metadata/appVersion") {
        object["app_version"] = app_version.clone();
    }
    object
}

#[async_trait]
impl ResourceProvider for HelmProvider {
    fn name(&self) -> &'static str {
        "helm"
    }

    fn handles(&self, resource_type: &ResourceType) -> bool {
        matches!(resource_type, ResourceType::HelmRelease)
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<Observed> {
        let locator = &request.locator;
        let spec = ReleaseSpec::from_properties(locator, &request.properties)?;
        let values = match &spec.values {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        // JSON is valid YAML, so helm reads it from stdin as a values file.
        let input = serde_json::to_vec(&values)?;

        info!(release = %locator.remote_name, chart = %spec.chart, namespace = %Self::namespace(locator), "Upgrading release");
        let output = self
            .run(&self.upgrade_args(locator, &spec), Some(&input))
            .await?;
        if !output.success {
            return Err(Self::failed("upgrade", &output).into());
        }

        self.observe(locator).await?.ok_or_else(|| {
            DeployError::Helm {
                command: "status".to_string(),
                output: format!("release {} missing after upgrade", locator.remote_name),
            }
            .into()
        })
    }

    async fn read(&self, locator: &ResourceLocator) -> Result<Option<Observed>> {
        Ok(self.observe(locator).await?)
    }

    async fn delete(&self, locator: &ResourceLocator) -> Result<()> {
        let output = self
            .run(&self.release_args(&["uninstall"], locator, false), None)
            .await?;
        if !output.success {
            if Self::is_release_missing(&output) {
                debug!(release = %locator.remote_name, "Release already gone");
                return Ok(());
            }
            return Err(Self::failed("uninstall", &output).into());
        }
        info!(release = %locator.remote_name, "Uninstalled release");
        Ok(())
    }

    fn readiness(&self, _resource_type: &ResourceType, observed: &Observed) -> Readiness {
        helm_readiness(&observed.object)
    }
}
