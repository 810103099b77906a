//! Cluster-backed services provider.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::{Api, Client, Config, api::ListParams, config::Kubeconfig};
use snafu::{ResultExt, Snafu};
use tracing::warn;

use super::{ServicesProvider, SliAnnotations, register_domains, service::Service};
use crate::retrieve::Retrieve;

#[derive(Debug, Snafu)]
pub enum K8sProviderError {
    #[snafu(display("unable to read kubeconfig '{path}': {source}"))]
    ReadKubeconfig {
        path: String,
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("unable to infer the in-cluster configuration: {source}"))]
    InferConfig {
        source: kube::config::InferConfigError,
    },

    #[snafu(display("unable to construct the Kubernetes client: {source}"))]
    BuildClient { source: kube::Error },
}

/// Lists `v1/Service` objects through the API server on every refresh and
/// rebuilds the host→service map from their annotations. Services with a
/// malformed declaration are skipped with a warning rather than failing the
/// whole refresh; one team's typo must not disable everyone's SLIs.
pub struct K8sServicesProvider {
    client: Client,
    annotations: SliAnnotations,
    default_domain: String,
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl K8sServicesProvider {
    /// Builds the provider, reading the kubeconfig at `config_path` or
    /// inferring the in-cluster configuration when no path is given.
    pub async fn new(
        config_path: Option<&Path>,
        annotations: SliAnnotations,
        default_domain: String,
    ) -> Result<Self, K8sProviderError> {
        let config = match config_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).context(ReadKubeconfigSnafu {
                    path: path.display().to_string(),
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                    .await
                    .context(ReadKubeconfigSnafu {
                        path: path.display().to_string(),
                    })?
            }
            None => Config::infer().await.context(InferConfigSnafu)?,
        };

        let client = Client::try_from(config).context(BuildClientSnafu)?;

        Ok(Self {
            client,
            annotations,
            default_domain,
            services: RwLock::new(HashMap::new()),
        })
    }

    fn rebuild(&self, items: Vec<KubeService>) {
        let mut services = HashMap::new();

        for item in items {
            let name = item.metadata.name.clone().unwrap_or_default();
            let annotations: BTreeMap<String, String> =
                item.metadata.annotations.unwrap_or_default();

            let service = match Service::from_annotations(&self.annotations, &annotations) {
                Ok(Some(mut service)) => {
                    service.name = name;
                    service
                }
                Ok(None) => continue,
                Err(error) => {
                    warn!(
                        message = "Skipping service with malformed SLI annotations.",
                        service = %name,
                        %error,
                    );
                    continue;
                }
            };

            register_domains(&mut services, Arc::new(service), &self.default_domain);
        }

        *self.services.write().expect("services lock poisoned") = services;
    }
}

impl ServicesProvider for K8sServicesProvider {
    fn service_by_host(&self, host: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .expect("services lock poisoned")
            .get(host)
            .cloned()
    }
}

#[async_trait]
impl Retrieve for K8sServicesProvider {
    async fn retrieve(&self) -> anyhow::Result<()> {
        let api: Api<KubeService> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        self.rebuild(list.items);
        Ok(())
    }
}
