//! Reloadable per-container read-rate policy.

mod provider;
mod rule;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use snafu::Snafu;

use crate::retrieve::Retrieve;
pub use provider::{RateRecordsProviderStub, RateRecordsProviderYaml};
pub use rule::{NamespaceRule, NamespacedPodRule, PodRule, RateRecord, RuleError};

#[derive(Debug, Snafu)]
pub enum RateError {
    #[snafu(display("rate must be greater than zero"))]
    RateInvalid,
}

/// Source of the full rule record list, queried on every refresh.
pub trait RateRecordsProvider: Send + Sync {
    fn rate_records(&self) -> anyhow::Result<Vec<RateRecord>>;
}

#[derive(Debug, Default)]
struct RuleSet {
    namespaced_pod: Vec<NamespacedPodRule>,
    pod: Vec<PodRule>,
    namespace: Vec<NamespaceRule>,
}

/// Maps a `(namespace, pod)` pair to a messages-per-second limit according
/// to regexp rules received from the provider. Reads take a shared lock;
/// refreshes replace the rule set wholesale under an exclusive lock.
pub struct Rater {
    rate_default: f64,
    provider: Arc<dyn RateRecordsProvider>,
    rules: RwLock<RuleSet>,
}

impl Rater {
    pub fn new(
        provider: Arc<dyn RateRecordsProvider>,
        rate_default: f64,
    ) -> Result<Self, RateError> {
        if rate_default <= 0.0 {
            return Err(RateError::RateInvalid);
        }

        Ok(Self {
            rate_default,
            provider,
            rules: RwLock::new(RuleSet::default()),
        })
    }

    /// Returns the rate of the first matching rule, scanning namespaced-pod
    /// rules, then pod rules, then namespace rules, or the default rate when
    /// nothing matches.
    pub fn rate(&self, namespace: &str, pod: &str) -> f64 {
        let rules = self.rules.read().expect("rate rules lock poisoned");

        for rule in &rules.namespaced_pod {
            if rule.matches(namespace, pod) {
                return rule.rate();
            }
        }

        for rule in &rules.pod {
            if rule.matches(pod) {
                return rule.rate();
            }
        }

        for rule in &rules.namespace {
            if rule.matches(namespace) {
                return rule.rate();
            }
        }

        self.rate_default
    }

    /// Re-reads the rule list from the provider. An empty result leaves the
    /// current rules in place; any invalid record aborts the whole refresh.
    fn refresh(&self) -> anyhow::Result<()> {
        let records = self.provider.rate_records()?;

        if records.is_empty() {
            return Ok(());
        }

        let mut replacement = RuleSet::default();

        for record in records {
            if record.namespace.is_empty() && record.pod.is_empty() {
                continue;
            }

            if !record.namespace.is_empty() && !record.pod.is_empty() {
                replacement
                    .namespaced_pod
                    .push(NamespacedPodRule::new(&record)?);
                continue;
            }

            if !record.pod.is_empty() {
                replacement.pod.push(PodRule::new(&record)?);
                continue;
            }

            replacement.namespace.push(NamespaceRule::new(&record)?);
        }

        let mut rules = self.rules.write().expect("rate rules lock poisoned");
        *rules = replacement;
        Ok(())
    }
}

#[async_trait]
impl Retrieve for Rater {
    async fn retrieve(&self) -> anyhow::Result<()> {
        self.refresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    struct StaticProvider {
        records: Mutex<Vec<RateRecord>>,
    }

    impl StaticProvider {
        fn new(records: Vec<RateRecord>) -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(records),
            })
        }

        fn replace(&self, records: Vec<RateRecord>) {
            *self.records.lock().unwrap() = records;
        }
    }

    impl RateRecordsProvider for StaticProvider {
        fn rate_records(&self) -> anyhow::Result<Vec<RateRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn record(namespace: &str, pod: &str, rate: f64) -> RateRecord {
        RateRecord {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            rate,
        }
    }

    fn rater_with(records: Vec<RateRecord>) -> (Rater, Arc<StaticProvider>) {
        let provider = StaticProvider::new(records);
        let rater = Rater::new(Arc::clone(&provider) as Arc<dyn RateRecordsProvider>, 100.0)
            .unwrap();
        rater.refresh().unwrap();
        (rater, provider)
    }

    #[test]
    fn default_rate_must_be_positive() {
        let provider = StaticProvider::new(vec![]);
        assert!(Rater::new(provider, 0.0).is_err());
    }

    #[test]
    fn precedence_is_namespaced_pod_then_pod_then_namespace() {
        let (rater, _provider) = rater_with(vec![
            record("^n$", "^p$", 1.0),
            record("", "^p$", 2.0),
            record("^n$", "", 3.0),
        ]);

        assert_eq!(rater.rate("n", "p"), 1.0);
        assert_eq!(rater.rate("x", "p"), 2.0);
        assert_eq!(rater.rate("n", "x"), 3.0);
        assert_eq!(rater.rate("x", "x"), 100.0);
    }

    #[test]
    fn empty_provider_result_keeps_current_rules() {
        let (rater, provider) = rater_with(vec![record("^n$", "", 3.0)]);
        assert_eq!(rater.rate("n", "p"), 3.0);

        provider.replace(vec![]);
        rater.refresh().unwrap();

        assert_eq!(rater.rate("n", "p"), 3.0);
    }

    #[test]
    fn invalid_record_aborts_refresh_keeping_state() {
        let (rater, provider) = rater_with(vec![record("^n$", "", 3.0)]);

        provider.replace(vec![record("^m$", "", 4.0), record("", "^(p$", 2.0)]);
        assert!(rater.refresh().is_err());

        assert_eq!(rater.rate("n", "anything"), 3.0);
        assert_eq!(rater.rate("m", "anything"), 100.0);
    }

    #[test]
    fn non_positive_rule_rate_aborts_refresh() {
        let (rater, provider) = rater_with(vec![record("^n$", "", 3.0)]);

        provider.replace(vec![record("", "^p$", 0.0)]);
        assert!(rater.refresh().is_err());
        assert_eq!(rater.rate("n", "p"), 3.0);
    }

    #[test]
    fn records_with_both_fields_empty_are_skipped() {
        let (rater, _provider) = rater_with(vec![record("", "", 9.0), record("^n$", "", 3.0)]);

        assert_eq!(rater.rate("n", "p"), 3.0);
        assert_eq!(rater.rate("other", "p"), 100.0);
    }
}
