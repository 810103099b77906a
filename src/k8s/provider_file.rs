//! File-backed services provider for non-Kubernetes launches.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};

use super::{
    ServicesProvider, SliAnnotations, register_domains,
    service::{AnnotatedService, Service, ServiceError},
};
use crate::retrieve::Retrieve;

#[derive(Debug, Snafu)]
pub enum FileProviderError {
    #[snafu(display("unable to read services source '{}': {source}", path.display()))]
    ReadSource { path: PathBuf, source: io::Error },

    #[snafu(display("unable to parse services source '{}': {source}", path.display()))]
    ParseSource {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("invalid service declaration in '{}': {source}", path.display()))]
    InvalidService {
        path: PathBuf,
        source: ServiceError,
    },
}

/// Provides a static host→service map from a YAML list of annotation maps.
/// The file does not change underneath a deployment, so it is read once.
pub struct FileServicesProvider {
    services: HashMap<String, Arc<Service>>,
}

impl FileServicesProvider {
    pub fn new(
        path: &Path,
        annotations: &SliAnnotations,
        default_domain: &str,
    ) -> Result<Self, FileProviderError> {
        let contents = fs::read_to_string(path).context(ReadSourceSnafu { path })?;
        let declarations: Vec<AnnotatedService> =
            serde_yaml::from_str(&contents).context(ParseSourceSnafu { path })?;

        let mut services = HashMap::new();

        for declaration in declarations {
            let service = Service::from_annotations(annotations, &declaration.annotations)
                .context(InvalidServiceSnafu { path })?;

            let Some(mut service) = service else {
                continue;
            };

            service.name = declaration.name;
            register_domains(&mut services, Arc::new(service), default_domain);
        }

        Ok(Self { services })
    }
}

impl ServicesProvider for FileServicesProvider {
    fn service_by_host(&self, host: &str) -> Option<Arc<Service>> {
        self.services.get(host).cloned()
    }
}

#[async_trait]
impl Retrieve for FileServicesProvider {
    /// The source file is static; nothing to refresh.
    async fn retrieve(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
