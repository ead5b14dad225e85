//! Kubernetes provider: server-side apply of namespaces and manifests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret as SecretObject;
use keel_core::provider::{ApplyRequest, Observed, Readiness, ResourceLocator, ResourceProvider};
use keel_core::value::PropertyValue;
use keel_core::{ResourceType, Result};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiResource, Scope};
use kube::{Client, Config};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::readiness::kubernetes_readiness;

/// Field manager recorded for server-side apply.
pub const FIELD_MANAGER: &str = "keel";

/// Kubernetes-backed provider for `Namespace` and manifest resources.
pub struct KubernetesProvider {
    client: Client,
    /// Discovered API resources keyed by `apiVersion/kind`.
    discovered: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl KubernetesProvider {
    /// Connect using the ambient kubeconfig, optionally pinned to a context.
    pub async fn new(context: Option<&str>) -> DeployResult<Self> {
        let client = match context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                let config = Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| DeployError::Invalid(format!("kubeconfig: {e}")))?;
                Client::try_from(config)?
            }
            None => Client::try_default().await?,
        };
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            discovered: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the API resource and scope for a type through discovery.
    async fn resource(&self, resource_type: &ResourceType) -> DeployResult<(ApiResource, bool)> {
        let (api_version, kind) = api_version_kind(resource_type)?;
        let key = format!("{api_version}/{kind}");
        if let Some(found) = self.discovered.lock().await.get(&key) {
            return Ok(found.clone());
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, capabilities) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| DeployError::Discovery {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                message: e.to_string(),
            })?;
        let namespaced = capabilities.scope == Scope::Namespaced;
        debug!(api_version = %api_version, kind = %kind, namespaced, "Discovered API resource");

        let found = (resource, namespaced);
        self.discovered.lock().await.insert(key, found.clone());
        Ok(found)
    }

    async fn api(&self, locator: &ResourceLocator) -> DeployResult<(Api<DynamicObject>, bool)> {
        let (resource, namespaced) = self.resource(&locator.resource_type).await?;
        let api = if namespaced {
            let namespace = locator.namespace.as_deref().unwrap_or("default");
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        Ok((api, namespaced))
    }
}

fn api_version_kind(resource_type: &ResourceType) -> DeployResult<(&str, &str)> {
    match resource_type {
        ResourceType::Namespace => Ok(("v1", "Namespace")),
        ResourceType::Manifest { api_version, kind } => Ok((api_version, kind)),
        ResourceType::HelmRelease => Err(DeployError::Invalid(
            "helm releases are not Kubernetes manifests".to_string(),
        )),
    }
}

/// The object sent for server-side apply: declared properties with type
/// and identity filled in.
pub fn manifest_body(
    locator: &ResourceLocator,
    properties: &Value,
    namespaced: bool,
) -> DeployResult<Value> {
    let (api_version, kind) = api_version_kind(&locator.resource_type)?;
    let mut body = match properties {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => {
            return Err(DeployError::Invalid(format!(
                "{locator}: properties must be a map"
            )));
        }
    };
    body.insert("apiVersion".to_string(), Value::String(api_version.to_string()));
    body.insert("kind".to_string(), Value::String(kind.to_string()));

    let metadata = body
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(metadata) = metadata else {
        return Err(DeployError::Invalid(format!(
            "{locator}: metadata must be a map"
        )));
    };
    metadata.insert("name".to_string(), Value::String(locator.remote_name.clone()));
    match (&locator.namespace, namespaced) {
        (Some(namespace), true) => {
            metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
        }
        (_, false) => {
            metadata.remove("namespace");
        }
        (None, true) => {}
    }
    Ok(Value::Object(body))
}

/// Turn a live object into an observation. Secret payloads are decoded and
/// exposed to references as secret values.
pub fn observe(kind: &str, mut object: Value) -> DeployResult<Observed> {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
    }
    let mut outputs = PropertyValue::from_json(object.clone());

    if kind == "Secret" {
        let secret: SecretObject =
            serde_json::from_value(object.clone()).map_err(|e| DeployError::Parse {
                what: "Secret".to_string(),
                message: e.to_string(),
            })?;
        if let PropertyValue::Map(fields) = &mut outputs {
            let decoded = secret.data.unwrap_or_default().into_iter().map(|(k, v)| {
                let plaintext = String::from_utf8_lossy(&v.0).into_owned();
                (k, PropertyValue::secret(PropertyValue::String(plaintext)))
            });
            fields.insert("data".to_string(), PropertyValue::Map(decoded.collect()));
            if let Some(string_data) = secret.string_data {
                let wrapped = string_data
                    .into_iter()
                    .map(|(k, v)| (k, PropertyValue::secret(PropertyValue::String(v))));
                fields.insert("stringData".to_string(), PropertyValue::Map(wrapped.collect()));
            }
        }
    }

    Ok(Observed { object, outputs })
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl ResourceProvider for KubernetesProvider {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn handles(&self, resource_type: &ResourceType) -> bool {
        matches!(
            resource_type,
            ResourceType::Namespace | ResourceType::Manifest { .. }
        )
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<Observed> {
        let locator = &request.locator;
        let (api, namespaced) = self.api(locator).await?;
        let body = manifest_body(locator, &request.properties, namespaced)?;
        let object: DynamicObject =
            serde_json::from_value(body).map_err(|e| DeployError::Parse {
                what: locator.to_string(),
                message: e.to_string(),
            })?;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(&locator.remote_name, &params, &Patch::Apply(&object))
            .await
            .map_err(DeployError::from)?;
        info!(target_object = %locator, "Applied manifest");

        let kind = locator.resource_type.kind().unwrap_or_default();
        let object = serde_json::to_value(&applied)?;
        Ok(observe(kind, object)?)
    }

    async fn read(&self, locator: &ResourceLocator) -> Result<Option<Observed>> {
        let (api, _) = self.api(locator).await?;
        let Some(found) = api
            .get_opt(&locator.remote_name)
            .await
            .map_err(DeployError::from)?
        else {
            return Ok(None);
        };
        let kind = locator.resource_type.kind().unwrap_or_default();
        Ok(Some(observe(kind, serde_json::to_value(&found)?)?))
    }

    async fn delete(&self, locator: &ResourceLocator) -> Result<()> {
        let (api, _) = self.api(locator).await?;
        match api.delete(&locator.remote_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(target_object = %locator, "Deleted object");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(target_object = %locator, "Object already gone");
                Ok(())
            }
            Err(e) => Err(DeployError::from(e).into()),
        }
    }

    fn readiness(&self, resource_type: &ResourceType, observed: &Observed) -> Readiness {
        kubernetes_readiness(resource_type.kind().unwrap_or_default(), &observed.object)
    }
}
