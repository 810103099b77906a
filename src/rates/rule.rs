//! Rate rule variants, matched in precedence order by the rater.

use regex::Regex;
use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};

/// One record of the rules list as it arrives from a provider.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RateRecord {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub rate: f64,
}

#[derive(Debug, Snafu)]
pub enum RuleError {
    #[snafu(display("rate must be greater than zero"))]
    NonPositiveRate,

    #[snafu(display("invalid rule regex '{pattern}': {source}"))]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
}

fn checked_rate(rate: f64) -> Result<f64, RuleError> {
    ensure!(rate > 0.0, NonPositiveRateSnafu);
    Ok(rate)
}

fn compiled(pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(pattern).context(BadPatternSnafu { pattern })
}

#[derive(Debug)]
pub struct NamespaceRule {
    rate: f64,
    namespace: Regex,
}

impl NamespaceRule {
    pub fn new(record: &RateRecord) -> Result<Self, RuleError> {
        Ok(Self {
            rate: checked_rate(record.rate)?,
            namespace: compiled(&record.namespace)?,
        })
    }

    pub fn matches(&self, namespace: &str) -> bool {
        self.namespace.is_match(namespace)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[derive(Debug)]
pub struct PodRule {
    rate: f64,
    pod: Regex,
}

impl PodRule {
    pub fn new(record: &RateRecord) -> Result<Self, RuleError> {
        Ok(Self {
            rate: checked_rate(record.rate)?,
            pod: compiled(&record.pod)?,
        })
    }

    pub fn matches(&self, pod: &str) -> bool {
        self.pod.is_match(pod)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[derive(Debug)]
pub struct NamespacedPodRule {
    rate: f64,
    namespace: Regex,
    pod: Regex,
}

impl NamespacedPodRule {
    pub fn new(record: &RateRecord) -> Result<Self, RuleError> {
        Ok(Self {
            rate: checked_rate(record.rate)?,
            namespace: compiled(&record.namespace)?,
            pod: compiled(&record.pod)?,
        })
    }

    pub fn matches(&self, namespace: &str, pod: &str) -> bool {
        self.namespace.is_match(namespace) && self.pod.is_match(pod)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}
