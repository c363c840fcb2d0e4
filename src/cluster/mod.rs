//! Kubernetes cluster client. `apply`/`get`/`delete` resolve an arbitrary
//! manifest's kind through API discovery so any kind present in Git can be
//! reconciled; `list_managed` targets the fixed set of kinds this
//! controller prunes, resolved at compile time to avoid a discovery round
//! trip on every sync.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::ErrorResponse;
use kube::{Client, Resource};

use crate::manifest::Manifest;

pub const FIELD_MANAGER: &str = "gitops-reconciler";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const PRUNE_OPT_OUT_ANNOTATION: &str = "gitops.controller/prune";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("could not resolve kind {api_version}/{kind}: {source}")]
    Discovery {
        api_version: String,
        kind: String,
        source: kube::Error,
    },

    #[error("manifest {0} has no namespace and the kind is namespaced")]
    MissingNamespace(String),

    #[error("failed to convert manifest {0} into a Kubernetes object: {1}")]
    InvalidManifest(String, serde_yaml::Error),
}

/// A resource currently present on the cluster, labeled as managed by this
/// controller.
#[derive(Debug, Clone)]
pub struct ClusterResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub object: DynamicObject,
}

impl ClusterResource {
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }

    pub fn prune_opted_out(&self) -> bool {
        self.annotations
            .get(PRUNE_OPT_OUT_ANNOTATION)
            .map(|v| v == "false")
            .unwrap_or(false)
    }

    fn from_dynamic(obj: DynamicObject, api_version: String, kind: String) -> Self {
        let meta = obj.metadata.clone();
        ClusterResource {
            api_version,
            kind,
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
            annotations: meta.annotations.unwrap_or_default(),
            labels: meta.labels.unwrap_or_default(),
            object: obj,
        }
    }
}

pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Applies `manifest` with server-side apply, force-owning any
    /// conflicting fields, and labels the result as managed by this
    /// controller so it becomes eligible for pruning and drift detection.
    pub async fn apply(&self, manifest: &Manifest) -> Result<ClusterResource, Error> {
        let (ar, namespaced) = self.resolve(&manifest.api_version, &manifest.kind).await?;

        let mut obj: DynamicObject = serde_yaml::from_value(manifest.body.clone())
            .map_err(|e| Error::InvalidManifest(manifest.name.clone(), e))?;
        obj.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(MANAGED_BY_LABEL.to_owned(), FIELD_MANAGER.to_owned());

        let api: Api<DynamicObject> = match (&manifest.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (None, true) => {
                return Err(Error::MissingNamespace(manifest.name.clone()));
            }
            (_, false) => Api::all_with(self.client.clone(), &ar),
        };

        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(&manifest.name, &pp, &Patch::Apply(&obj)).await?;
        Ok(ClusterResource::from_dynamic(
            applied,
            manifest.api_version.clone(),
            manifest.kind.clone(),
        ))
    }

    pub async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ClusterResource>, Error> {
        let (ar, namespaced) = self.resolve(api_version, kind).await?;
        let api: Api<DynamicObject> = match (namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (_, _) => Api::all_with(self.client.clone(), &ar),
        };
        match api.get(name).await {
            Ok(obj) => Ok(Some(ClusterResource::from_dynamic(
                obj,
                api_version.to_owned(),
                kind.to_owned(),
            ))),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Error> {
        let (ar, namespaced) = self.resolve(api_version, kind).await?;
        let api: Api<DynamicObject> = match (namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (_, _) => Api::all_with(self.client.clone(), &ar),
        };
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists every resource of the fixed managed-kind set in `namespace`
    /// carrying the controller's `managed-by` label. This is the sole
    /// pruning criterion: anything with the label but absent from the
    /// latest Git sync is a deletion candidate.
    pub async fn list_managed(&self, namespace: &str) -> Result<Vec<ClusterResource>, Error> {
        let selector = format!("{MANAGED_BY_LABEL}={FIELD_MANAGER}");
        let lp = ListParams::default().labels(&selector);

        let (deployments, stateful_sets, services, config_maps, secrets, ingresses) = futures::try_join!(
            self.list_kind::<Deployment>(namespace, &lp, "apps/v1", "Deployment"),
            self.list_kind::<StatefulSet>(namespace, &lp, "apps/v1", "StatefulSet"),
            self.list_kind::<Service>(namespace, &lp, "v1", "Service"),
            self.list_kind::<ConfigMap>(namespace, &lp, "v1", "ConfigMap"),
            self.list_kind::<Secret>(namespace, &lp, "v1", "Secret"),
            self.list_kind::<Ingress>(namespace, &lp, "networking.k8s.io/v1", "Ingress"),
        )?;

        let mut all = Vec::new();
        all.extend(deployments);
        all.extend(stateful_sets);
        all.extend(services);
        all.extend(config_maps);
        all.extend(secrets);
        all.extend(ingresses);
        Ok(all)
    }

    /// Idempotently ensures the target namespace exists, applying a bare
    /// `Namespace` manifest through the same server-side apply path as any
    /// other resource.
    pub async fn ensure_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        let pp = PatchParams::apply(FIELD_MANAGER);
        api.patch(name, &pp, &Patch::Apply(&ns)).await?;
        Ok(())
    }

    async fn list_kind<K>(
        &self,
        namespace: &str,
        lp: &ListParams,
        api_version: &str,
        kind: &str,
    ) -> Result<Vec<ClusterResource>, Error>
    where
        K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned + serde::Serialize,
    {
        let ar = ApiResource::erase::<K>(&());
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let list = api.list(lp).await?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| ClusterResource::from_dynamic(obj, api_version.to_owned(), kind.to_owned()))
            .collect())
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), Error> {
        let gvk = gvk_from(api_version, kind);
        let (ar, caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|source| Error::Discovery {
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
                source,
            })?;
        Ok((ar, caps.scope == kube::discovery::Scope::Namespaced))
    }
}

fn gvk_from(api_version: &str, kind: &str) -> kube::core::GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => kube::core::GroupVersionKind::gvk(group, version, kind),
        None => kube::core::GroupVersionKind::gvk("", api_version, kind),
    }
}
