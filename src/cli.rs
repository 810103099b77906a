//! Command line and environment configuration surface.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use serde_json::Value;

use crate::{
    dispatcher::{FollowerConfig, JournaldConfig},
    entry::{
        EntryMap, KUBERNETES_NODE_HOSTNAME, LABEL_DATACENTER, LABEL_LOG_TYPE,
        LABEL_LOGSTASH_PREFIX, LABEL_PURPOSE,
    },
    k8s::SliAnnotations,
    parsers::ParserConfig,
    transport::{AmqpConfig, FirehoseConfig, RedisConfig},
};

const DEFAULT_SLA_BUCKETS: &str = "0.01 0.02 0.04 0.06 0.08 0.1 0.15 0.2 0.25 0.3 0.4 0.5 \
                                   0.6 0.7 0.8 0.9 1 1.2 1.5 1.75 2 3 4 5 8 10 20 60";

/// Node-local log shipper for container workloads.
#[derive(Debug, Parser)]
#[command(name = "logship", version, about)]
pub struct Opts {
    /// Path to the file where log file cursors are persisted.
    #[arg(long, env = "POSITION_FILE_PATH", default_value = "/var/log/logship.pos")]
    pub position_file_path: PathBuf,

    /// Path under which log files are discovered.
    #[arg(long, env = "LOGS_PATH", default_value = "/var/log/pods/")]
    pub logs_path: PathBuf,

    /// How often to re-scan the logs path for targets, seconds.
    #[arg(long, env = "TARGETS_REFRESH_INTERVAL_SEC", default_value_t = 10)]
    pub targets_refresh_interval_sec: u64,

    /// Containers whose name contains this string are never ingested.
    #[arg(long, env = "SELF_CONTAINER_NAME", default_value = "logship")]
    pub self_container_name: String,

    /// Transport type for log messages [amqp | redis | firehose].
    #[arg(long, env = "TRANSPORT", default_value = "amqp")]
    pub transport: String,

    /// Redis host to use.
    #[arg(long, env = "REDIS_HOSTNAME", default_value = "localhost:6379")]
    pub redis_hostname: String,

    /// Redis password to use.
    #[arg(long, env = "REDIS_PASSWORD", default_value = "")]
    pub redis_password: String,

    /// Redis list messages are pushed onto.
    #[arg(long, env = "REDIS_KEY", default_value = "k8s-logs")]
    pub redis_key: String,

    /// AMQP broker URL to use.
    #[arg(long, env = "AMQP_URL", default_value = "amqp://localhost/")]
    pub amqp_url: String,

    /// AMQP exchange for log message delivery.
    #[arg(long, env = "AMQP_EXCHANGE", default_value = "amq.direct")]
    pub amqp_exchange: String,

    /// AMQP routing key for message delivery.
    #[arg(long, env = "AMQP_ROUTING_KEY", default_value = "all-other")]
    pub amqp_routing_key: String,

    /// AWS Firehose delivery stream.
    #[arg(long, env = "FIREHOSE_DELIVERY_STREAM", default_value = "default-delivery")]
    pub firehose_delivery_stream: String,

    /// How often to flush buffered messages to the transport, seconds.
    #[arg(long, env = "FLUSH_INTERVAL_SEC", default_value_t = 60)]
    pub flush_interval_sec: u64,

    /// Maximum messages to buffer before delivering a batch.
    #[arg(long, env = "BUFFER_SIZE_MAX", default_value_t = 1000)]
    pub buffer_size_max: usize,

    /// Reader buffer size, bytes; hence the maximum log message length.
    #[arg(long, env = "READER_BUFFER_SIZE", default_value_t = 32000)]
    pub reader_buffer_size: usize,

    /// How often a follower re-queries its throttling limit, seconds.
    #[arg(long, env = "THROTTLING_LIMITS_UPDATE_INTERVAL_SEC", default_value_t = 600)]
    pub throttling_limits_update_interval_sec: u64,

    /// How long a follower sleeps when its file has no new records, seconds.
    #[arg(long, env = "NO_RECORDS_SLEEP_SEC", default_value_t = 4)]
    pub no_records_sleep_sec: u64,

    /// How often a follower persists its cursor, seconds.
    #[arg(long, env = "CURSOR_COMMIT_INTERVAL_SEC", default_value_t = 60)]
    pub cursor_commit_interval_sec: u64,

    /// Whether files without a valid stored cursor start at the tail.
    #[arg(long, env = "FROM_TAIL_FLAG")]
    pub from_tail: bool,

    /// Whether to follow the system journal.
    #[arg(
        long,
        env = "LOG_JOURNALD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub log_journald: bool,

    /// Path to the file with the machine identifier.
    #[arg(long, env = "MACHINE_ID_PATH", default_value = "/etc/machine-id")]
    pub machine_id_path: PathBuf,

    /// Journal directory base path.
    #[arg(long, env = "JOURNALD_PATH", default_value = "/var/log/journal/")]
    pub journald_path: PathBuf,

    /// Path to the throttling rules file; when absent the default rate
    /// applies to every container.
    #[arg(long, env = "READ_RATE_RULES_PATH")]
    pub read_rate_rules_path: Option<PathBuf>,

    /// Default maximum log messages to read per container per second.
    #[arg(long, env = "READ_RATE_DEFAULT", default_value_t = 500.0)]
    pub read_rate_default: f64,

    /// Datacenter name, included in every log message.
    #[arg(long, env = "DC", default_value = "")]
    pub dc: String,

    /// Deployment purpose, included in every log message.
    #[arg(long, env = "PURPOSE", default_value = "")]
    pub purpose: String,

    /// Node hostname, included in every log message.
    #[arg(long, env = "NODE_HOSTNAME", default_value = "")]
    pub node_hostname: String,

    /// Log type, included in every log message.
    #[arg(long, env = "LOG_TYPE", default_value = "containers")]
    pub log_type: String,

    /// Logstash prefix, included in every log message.
    #[arg(long, env = "LOGSTASH_PREFIX", default_value = "k8s-unknown")]
    pub logstash_prefix: String,

    /// Whether to export SLI metrics.
    #[arg(
        long,
        env = "SLA_EXPORTER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub sla_exporter: bool,

    /// Kubernetes config file path; in-cluster configuration when absent.
    #[arg(long, env = "K8S_CONFIG_PATH")]
    pub k8s_config_path: Option<PathBuf>,

    /// Enables SLI in non-Kubernetes mode; path to a services declaration.
    #[arg(long, env = "SLA_SERVICE_SOURCE_PATH")]
    pub sla_service_source_path: Option<PathBuf>,

    /// Domain appended to service domains that carry none.
    #[arg(long, env = "SERVICE_DEFAULT_DOMAIN", default_value = "cluster.local")]
    pub default_service_domain: String,

    /// How often to refresh the services list, seconds.
    #[arg(long, env = "SERVICE_UPDATE_INTERVAL_SEC", default_value_t = 60)]
    pub service_update_interval_sec: u64,

    /// Space-delimited histogram bucket upper bounds.
    #[arg(long, env = "SLA_BUCKETS", default_value = DEFAULT_SLA_BUCKETS)]
    pub sla_buckets: String,

    /// Service annotation that enables SLI exporting.
    #[arg(
        long,
        env = "SLA_SERVICE_ANNOTATION_ENABLE",
        default_value = "logship.io/sla-enabled"
    )]
    pub sla_annotation_enable: String,

    /// Service annotation holding the labeled path regex groups.
    #[arg(
        long,
        env = "SLA_SERVICE_ANNOTATION_PATHS",
        default_value = "logship.io/sla-paths"
    )]
    pub sla_annotation_paths: String,

    /// Service annotation holding the domains list.
    #[arg(
        long,
        env = "SLA_SERVICE_ANNOTATION_DOMAINS",
        default_value = "logship.io/sla-domains"
    )]
    pub sla_annotation_domains: String,

    /// Record field where the user log is placed; empty for the root.
    #[arg(long, env = "USER_LOG_FIELDS_KEY", default_value = "")]
    pub user_log_fields_key: String,

    /// Record field where the container engine fields are placed.
    #[arg(long, env = "CRI_FIELDS_KEY", default_value = "")]
    pub cri_fields_key: String,

    /// Record field where the shipper and Kubernetes metadata is placed.
    #[arg(long, env = "EXTENDS_FIELDS_KEY", default_value = "")]
    pub extends_fields_key: String,

    /// Field inside the user log map used for non-JSON messages.
    #[arg(long, env = "RAW_LOG_FIELD_KEY", default_value = "msg")]
    pub raw_log_field_key: String,

    /// Whether to flatten a JSON user log into dotted keys.
    #[arg(
        long,
        env = "FLATTEN_USER_LOG",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub flatten_user_log: bool,

    /// Prometheus metrics reset interval, seconds.
    #[arg(long, env = "METRICS_RESET_INTERVAL_SEC", default_value_t = 172_800)]
    pub metrics_reset_interval_sec: u64,

    /// Address the metrics endpoint binds to.
    #[arg(long, env = "METRICS_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_listen_addr: String,

    /// Main log level.
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Main log format [json | plain].
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,
}

impl Opts {
    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            user_log_fields_key: self.user_log_fields_key.clone(),
            cri_fields_key: self.cri_fields_key.clone(),
            extends_fields_key: self.extends_fields_key.clone(),
            raw_log_field_key: self.raw_log_field_key.clone(),
            flatten_user_log: self.flatten_user_log,
        }
    }

    pub fn follower_config(&self) -> FollowerConfig {
        FollowerConfig {
            reader_buffer_size: self.reader_buffer_size,
            from_tail: self.from_tail,
            sleep_no_records: Duration::from_secs(self.no_records_sleep_sec),
            commit_interval: Duration::from_secs(self.cursor_commit_interval_sec),
            rate_update_interval: Duration::from_secs(
                self.throttling_limits_update_interval_sec,
            ),
        }
    }

    pub fn journald_config(&self) -> JournaldConfig {
        JournaldConfig {
            machine_id_path: self.machine_id_path.clone(),
            journald_path: self.journald_path.clone(),
        }
    }

    pub fn sli_annotations(&self) -> SliAnnotations {
        SliAnnotations {
            enable: self.sla_annotation_enable.clone(),
            paths: self.sla_annotation_paths.clone(),
            domains: self.sla_annotation_domains.clone(),
        }
    }

    pub fn amqp_config(&self) -> AmqpConfig {
        AmqpConfig {
            url: self.amqp_url.clone(),
            exchange: self.amqp_exchange.clone(),
            routing_key: self.amqp_routing_key.clone(),
        }
    }

    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            hostname: self.redis_hostname.clone(),
            password: self.redis_password.clone(),
            key: self.redis_key.clone(),
        }
    }

    pub fn firehose_config(&self) -> FirehoseConfig {
        FirehoseConfig {
            delivery_stream: self.firehose_delivery_stream.clone(),
        }
    }

    /// Node-level metadata merged into every emitted record.
    pub fn node_extends(&self) -> EntryMap {
        let mut extends = EntryMap::new();
        extends.insert(
            KUBERNETES_NODE_HOSTNAME.to_string(),
            Value::String(self.node_hostname.clone()),
        );
        extends.insert(
            LABEL_DATACENTER.to_string(),
            Value::String(self.dc.clone()),
        );
        extends.insert(LABEL_PURPOSE.to_string(), Value::String(self.purpose.clone()));
        extends.insert(
            LABEL_LOGSTASH_PREFIX.to_string(),
            Value::String(self.logstash_prefix.clone()),
        );
        extends.insert(
            LABEL_LOG_TYPE.to_string(),
            Value::String(self.log_type.clone()),
        );
        extends
    }
}
