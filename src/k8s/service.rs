//! Structured "service" representation for SLI metrics gathering.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use super::SliAnnotations;

const ENABLE_TRUE: &str = "true";
const ENABLE_TRUE_ALTERNATE: &str = "enabled";

/// Groups a set of URI regexes under one metrics label.
#[derive(Debug)]
pub struct PathSet {
    pub label: String,
    pub patterns: Vec<Regex>,
}

/// A service with the paths and domains its SLI metrics are keyed by.
#[derive(Debug)]
pub struct Service {
    pub name: String,
    pub enabled: bool,
    pub paths: Vec<PathSet>,
    pub domains: Vec<String>,
}

#[derive(Debug, Snafu)]
pub enum ServiceError {
    #[snafu(display("domains annotation '{annotation}' holds no usable domain names"))]
    NoDomains { annotation: String },

    #[snafu(display("missing paths annotation '{annotation}'"))]
    MissingPaths { annotation: String },

    #[snafu(display("paths annotation is an empty string"))]
    EmptyPathsAnnotation,

    #[snafu(display("unable to parse paths annotation '{value}': {source}"))]
    BadPathsSyntax {
        value: String,
        source: serde_json::Error,
    },

    #[snafu(display("paths annotation '{value}' must not hold empty labels"))]
    EmptyLabel { value: String },

    #[snafu(display("paths annotation '{value}' must hold at least one path group"))]
    NoPathGroups { value: String },

    #[snafu(display("label '{label}' must map to at least one non-empty regexp"))]
    EmptyPatterns { label: String },

    #[snafu(display("unable to compile path regexp '{pattern}': {source}"))]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
}

impl Service {
    /// Matches `path` against the ordered path sets and returns the label of
    /// the first regex that matches.
    pub fn label_by_path(&self, path: &str) -> Option<&str> {
        for set in &self.paths {
            for pattern in &set.patterns {
                if pattern.is_match(path) {
                    return Some(&set.label);
                }
            }
        }

        None
    }

    /// Builds a service from an annotations dictionary. Returns `Ok(None)`
    /// when the enable annotation is absent or not affirmative; malformed
    /// domain or path annotations are errors.
    pub fn from_annotations(
        keys: &SliAnnotations,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, ServiceError> {
        let enabled = match annotations.get(&keys.enable) {
            Some(value) => value,
            None => return Ok(None),
        };

        if enabled != ENABLE_TRUE && enabled != ENABLE_TRUE_ALTERNATE {
            return Ok(None);
        }

        let domains = annotations
            .get(&keys.domains)
            .map(|value| split_domains(value))
            .unwrap_or_default();

        ensure!(
            !domains.is_empty(),
            NoDomainsSnafu {
                annotation: keys.domains.clone(),
            }
        );

        let paths = annotations
            .get(&keys.paths)
            .context(MissingPathsSnafu {
                annotation: keys.paths.clone(),
            })?;

        Ok(Some(Self {
            name: String::new(),
            enabled: true,
            paths: parse_paths(paths)?,
            domains,
        }))
    }
}

fn parse_paths(value: &str) -> Result<Vec<PathSet>, ServiceError> {
    let value = value.trim();

    ensure!(!value.is_empty(), EmptyPathsAnnotationSnafu);

    let data: Vec<BTreeMap<String, Vec<String>>> =
        serde_json::from_str(value).context(BadPathsSyntaxSnafu { value })?;

    let mut sets = Vec::new();

    for group in &data {
        for (label, patterns) in group {
            ensure!(!label.is_empty(), EmptyLabelSnafu { value });
            ensure!(
                !patterns.is_empty(),
                EmptyPatternsSnafu { label: label.clone() }
            );

            let mut compiled = Vec::with_capacity(patterns.len());

            for pattern in patterns {
                let pattern = pattern.trim();
                ensure!(
                    !pattern.is_empty(),
                    EmptyPatternsSnafu { label: label.clone() }
                );
                compiled.push(Regex::new(pattern).context(BadPatternSnafu { pattern })?);
            }

            sets.push(PathSet {
                label: label.clone(),
                patterns: compiled,
            });
        }
    }

    ensure!(!sets.is_empty(), NoPathGroupsSnafu { value });
    Ok(sets)
}

fn split_domains(domains: &str) -> Vec<String> {
    domains
        .trim()
        .trim_matches(',')
        .split(',')
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Deserialized shape of one entry of the file-based services source.
#[derive(Debug, Deserialize)]
pub(crate) struct AnnotatedService {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SliAnnotations {
        SliAnnotations::default()
    }

    fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn enabled_annotations(paths: &str, domains: &str) -> BTreeMap<String, String> {
        annotations(&[
            ("logship.io/sla-enabled", "true"),
            ("logship.io/sla-paths", paths),
            ("logship.io/sla-domains", domains),
        ])
    }

    #[test]
    fn absent_or_negative_enable_yields_no_service() {
        assert!(
            Service::from_annotations(&keys(), &annotations(&[]))
                .unwrap()
                .is_none()
        );

        let disabled = annotations(&[("logship.io/sla-enabled", "false")]);
        assert!(
            Service::from_annotations(&keys(), &disabled)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn builds_a_service_from_valid_annotations() {
        let service = Service::from_annotations(
            &keys(),
            &enabled_annotations(
                r#"[{"/v1/items": ["^/v1/items/", "^/items/"]}, {"/health": ["^/healthz$"]}]"#,
                "api, api.example.test,",
            ),
        )
        .unwrap()
        .unwrap();

        assert!(service.enabled);
        assert_eq!(service.domains, vec!["api", "api.example.test"]);
        assert_eq!(service.label_by_path("/items/7"), Some("/v1/items"));
        assert_eq!(service.label_by_path("/healthz"), Some("/health"));
        assert_eq!(service.label_by_path("/nothing"), None);
    }

    #[test]
    fn first_matching_path_set_wins() {
        let service = Service::from_annotations(
            &keys(),
            &enabled_annotations(
                r#"[{"first": ["^/a"]}, {"second": ["^/a/b"]}]"#,
                "api",
            ),
        )
        .unwrap()
        .unwrap();

        assert_eq!(service.label_by_path("/a/b"), Some("first"));
    }

    #[test]
    fn missing_domains_or_paths_are_errors() {
        let no_domains = annotations(&[
            ("logship.io/sla-enabled", "true"),
            ("logship.io/sla-paths", r#"[{"l": ["^/"]}]"#),
        ]);
        assert!(Service::from_annotations(&keys(), &no_domains).is_err());

        let no_paths = annotations(&[
            ("logship.io/sla-enabled", "true"),
            ("logship.io/sla-domains", "api"),
        ]);
        assert!(Service::from_annotations(&keys(), &no_paths).is_err());
    }

    #[test]
    fn malformed_paths_are_errors() {
        for paths in [
            "",
            "not json",
            "[]",
            r#"[{"": ["^/"]}]"#,
            r#"[{"label": []}]"#,
            r#"[{"label": [" "]}]"#,
            r#"[{"label": ["^(/"]}]"#,
        ] {
            let result =
                Service::from_annotations(&keys(), &enabled_annotations(paths, "api"));
            assert!(result.is_err(), "paths {paths:?} should be rejected");
        }
    }
}
