//! Component wiring and lifecycle.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::{
    channels::{self, CHANNEL_CAPACITY},
    cli::Opts,
    containers::FsTargetProvider,
    dispatcher::{Dispatcher, FollowerFactory, FollowerMetrics},
    k8s::{
        FileProviderError, FileServicesProvider, K8sProviderError, K8sServicesProvider,
        ServicesProvider, ServicesProviderStub,
    },
    metrics::{self, Collector, MetricsError},
    parsers::{SliMetrics, SliObserver, SliParser, SliStub},
    rates::{
        RateError, RateRecordsProvider, RateRecordsProviderStub, RateRecordsProviderYaml, Rater,
    },
    retrieve::{Retrieve, retrieve_periodic},
    stages::{
        FilterStage, MarshalStage, PARALLELISM, ParseStage, SliStage, TransportStage,
    },
    storage::{CursorStore, StorageError},
    transport::{
        AmqpTransport, FirehoseTransport, RedisTransport, TYPE_AMQP, TYPE_FIREHOSE, TYPE_REDIS,
        TYPES_SUPPORTED, Transport, TransportError,
    },
};

#[derive(Debug, Snafu)]
pub enum StartupError {
    #[snafu(display("unsupported transport type '{transport}', supported types: [{supported}]"))]
    UnknownTransport {
        transport: String,
        supported: String,
    },

    #[snafu(display("unable to init the transport client: {source}"))]
    TransportInit { source: TransportError },

    #[snafu(display("unable to open the cursor storage: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("unable to init the target provider: {source}"))]
    Provider { source: io::Error },

    #[snafu(display("unable to init the metrics collector: {source}"))]
    Metrics { source: MetricsError },

    #[snafu(display("unable to init the rate policy: {source}"))]
    Rates { source: RateError },

    #[snafu(display("unable to load the services source: {source}"))]
    ServicesFile { source: FileProviderError },

    #[snafu(display("unable to init the Kubernetes services provider: {source}"))]
    ServicesCluster { source: K8sProviderError },

    #[snafu(display("invalid metrics listen address '{address}': {source}"))]
    ListenAddr {
        address: String,
        source: std::net::AddrParseError,
    },
}

/// Process exit code for a startup failure.
pub fn exit_code(error: &StartupError) -> i32 {
    match error {
        StartupError::UnknownTransport { .. } => exitcode::USAGE,
        StartupError::Storage { .. } | StartupError::Provider { .. } => exitcode::IOERR,
        _ => exitcode::CONFIG,
    }
}

/// Builds every component, runs the pipeline and blocks until SIGINT or
/// SIGTERM, then shuts the pipeline down in leaf-to-root order.
pub async fn run(opts: Opts) -> Result<(), StartupError> {
    info!(
        message = "Starting.",
        transport = %opts.transport,
        logs_path = %opts.logs_path.display(),
        position_file = %opts.position_file_path.display(),
    );

    let transport: Arc<dyn Transport> = match opts.transport.as_str() {
        TYPE_AMQP => Arc::new(
            AmqpTransport::new(opts.amqp_config())
                .await
                .context(TransportInitSnafu)?,
        ),
        TYPE_REDIS => Arc::new(RedisTransport::new(opts.redis_config()).context(TransportInitSnafu)?),
        TYPE_FIREHOSE => Arc::new(FirehoseTransport::new(opts.firehose_config()).await),
        other => {
            return UnknownTransportSnafu {
                transport: other,
                supported: TYPES_SUPPORTED.join(", "),
            }
            .fail();
        }
    };

    let storage =
        Arc::new(CursorStore::open(&opts.position_file_path).context(StorageSnafu)?);
    let targets_provider = Arc::new(
        FsTargetProvider::new(&opts.logs_path, opts.self_container_name.as_str())
            .context(ProviderSnafu)?,
    );
    let collector = Arc::new(Collector::new(&opts.sla_buckets).context(MetricsSnafu)?);

    let records_provider: Arc<dyn RateRecordsProvider> = match &opts.read_rate_rules_path {
        Some(path) => Arc::new(RateRecordsProviderYaml::new(path)),
        None => Arc::new(RateRecordsProviderStub),
    };
    let rater =
        Arc::new(Rater::new(records_provider, opts.read_rate_default).context(RatesSnafu)?);

    let (services, services_retriever) = build_services_provider(&opts).await?;

    let observer: Arc<dyn SliObserver> = if opts.sla_exporter {
        Arc::new(SliParser::new(
            Arc::clone(&services),
            Arc::clone(&collector) as Arc<dyn SliMetrics>,
        ))
    } else {
        Arc::new(SliStub)
    };

    let listen_addr: SocketAddr =
        opts.metrics_listen_addr.parse().context(ListenAddrSnafu {
            address: opts.metrics_listen_addr.clone(),
        })?;

    let token = CancellationToken::new();

    tokio::spawn(metrics::serve(
        listen_addr,
        Arc::clone(&collector),
        token.clone(),
    ));

    tokio::spawn(retrieve_periodic(
        token.clone(),
        Arc::clone(&collector) as Arc<dyn Retrieve>,
        Duration::from_secs(opts.metrics_reset_interval_sec),
    ));
    tokio::spawn(retrieve_periodic(
        token.clone(),
        Arc::clone(&rater) as Arc<dyn Retrieve>,
        Duration::from_secs(opts.throttling_limits_update_interval_sec),
    ));

    if let Some(retriever) = services_retriever {
        tokio::spawn(retrieve_periodic(
            token.clone(),
            retriever,
            Duration::from_secs(opts.service_update_interval_sec),
        ));
    }

    let (entries_tx, entries_rx) = async_channel::bounded(CHANNEL_CAPACITY);
    let (journald_tx, journald_rx) = async_channel::bounded(CHANNEL_CAPACITY);

    let factory = FollowerFactory::new(
        opts.follower_config(),
        opts.journald_config(),
        opts.node_extends(),
        Arc::clone(&storage),
        Arc::clone(&rater),
        Arc::clone(&collector) as Arc<dyn FollowerMetrics>,
    );
    let dispatcher = Dispatcher::new(
        factory,
        targets_provider,
        Arc::clone(&storage),
        opts.log_journald,
        Duration::from_secs(opts.targets_refresh_interval_sec),
        entries_tx,
        journald_tx,
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(token.clone()));

    let tracker = TaskTracker::new();
    let parser_config = Arc::new(opts.parser_config());

    let parsed = ParseStage::spawn(&tracker, PARALLELISM, parser_config, entries_rx);
    let observed = SliStage::spawn(
        &tracker,
        PARALLELISM,
        opts.user_log_fields_key.clone(),
        observer,
        parsed,
    );
    let filtered = FilterStage::spawn(
        &tracker,
        PARALLELISM,
        opts.user_log_fields_key.clone(),
        observed,
    );
    let marshalled = MarshalStage::spawn(&tracker, PARALLELISM, filtered);

    TransportStage::spawn(
        &tracker,
        PARALLELISM,
        Arc::clone(&transport),
        opts.buffer_size_max,
        Duration::from_secs(opts.flush_interval_sec),
        channels::merge(vec![marshalled, journald_rx]),
    );
    tracker.close();

    wait_for_shutdown_signal().await;
    info!(message = "Caught shutdown signal.");

    token.cancel();

    if dispatcher_task.await.is_err() {
        error!(message = "Dispatcher task failed.");
    }

    tracker.wait().await;

    if let Err(error) = transport.close().await {
        error!(message = "Error closing the transport.", %error);
    }

    if let Err(error) = storage.close() {
        error!(message = "Error closing the cursor storage.", %error);
    }

    info!(message = "Stopped.");
    Ok(())
}

async fn build_services_provider(
    opts: &Opts,
) -> Result<(Arc<dyn ServicesProvider>, Option<Arc<dyn Retrieve>>), StartupError> {
    if !opts.sla_exporter {
        return Ok((Arc::new(ServicesProviderStub), None));
    }

    match &opts.sla_service_source_path {
        Some(path) => {
            let provider = Arc::new(
                FileServicesProvider::new(
                    path,
                    &opts.sli_annotations(),
                    &opts.default_service_domain,
                )
                .context(ServicesFileSnafu)?,
            );

            Ok((
                Arc::clone(&provider) as Arc<dyn ServicesProvider>,
                Some(provider as Arc<dyn Retrieve>),
            ))
        }
        None => {
            let provider = Arc::new(
                K8sServicesProvider::new(
                    opts.k8s_config_path.as_deref(),
                    opts.sli_annotations(),
                    opts.default_service_domain.clone(),
                )
                .await
                .context(ServicesClusterSnafu)?,
            );

            Ok((
                Arc::clone(&provider) as Arc<dyn ServicesProvider>,
                Some(provider as Arc<dyn Retrieve>),
            ))
        }
    }
}

async fn wait_for_shutdown_signal() {
    let terminate = signal(SignalKind::terminate());

    match terminate {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(error) => {
            warn!(message = "Unable to listen for SIGTERM.", %error);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
