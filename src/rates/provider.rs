//! Rate rule record providers.

use std::{fs, path::PathBuf};

use super::{RateRecord, RateRecordsProvider};

/// Reads the full rules list from a YAML file on every refresh.
pub struct RateRecordsProviderYaml {
    path: PathBuf,
}

impl RateRecordsProviderYaml {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RateRecordsProvider for RateRecordsProviderYaml {
    fn rate_records(&self) -> anyhow::Result<Vec<RateRecord>> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

/// Returns an empty rules list; used when no rules file is configured.
pub struct RateRecordsProviderStub;

impl RateRecordsProvider for RateRecordsProviderStub {
    fn rate_records(&self) -> anyhow::Result<Vec<RateRecord>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn reads_records_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "- namespace: \"^kube-system$\"\n  rate: 50\n- pod: \"^noisy-\"\n  rate: 5.5"
        )
        .unwrap();

        let provider = RateRecordsProviderYaml::new(file.path());
        let records = provider.rate_records().unwrap();

        assert_eq!(
            records,
            vec![
                RateRecord {
                    namespace: "^kube-system$".into(),
                    pod: String::new(),
                    rate: 50.0,
                },
                RateRecord {
                    namespace: String::new(),
                    pod: "^noisy-".into(),
                    rate: 5.5,
                },
            ]
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let provider = RateRecordsProviderYaml::new("/nonexistent/rules.yaml");
        assert!(provider.rate_records().is_err());
    }

    #[test]
    fn stub_returns_no_records() {
        assert!(RateRecordsProviderStub.rate_records().unwrap().is_empty());
    }
}
