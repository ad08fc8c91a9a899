#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use cleanup_governor_domain::{
    ensure_non_empty, hash_bytes, hash_json, Domain, DomainConfig, DomainConfigEnvelope,
};
use serde::{Deserialize, Serialize};

const CONFIG_NORMALIZATION_VERSION: u32 = 1;

/// Endpoint settings for one HTTP collaborator (validation gate or
/// execution relay). The bearer token is resolved from an environment
/// variable at call time; the config file never carries a secret.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HttpServiceConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceEndpoints {
    #[serde(default)]
    pub gate: Option<HttpServiceConfig>,
    #[serde(default)]
    pub relay: Option<HttpServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GovernorConfig {
    #[serde(default)]
    pub services: ServiceEndpoints,
    pub domains: Vec<DomainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernorConfigEnvelope {
    pub source_yaml_hash: String,
    pub normalization_version: u32,
    pub services: ServiceEndpoints,
    pub domains: Vec<DomainConfigEnvelope>,
}

impl GovernorConfigEnvelope {
    #[must_use]
    pub fn domain(&self, name: &str) -> Option<&DomainConfigEnvelope> {
        self.domains
            .iter()
            .find(|envelope| envelope.config.domain.as_str() == name)
    }
}

/// Load governor YAML from disk and normalize it into canonical form.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or
/// normalized.
pub fn load_governor_config_from_path(path: &Path) -> Result<GovernorConfigEnvelope> {
    let content = fs::read_to_string(path)?;
    parse_governor_config_yaml(&content)
}

/// Parse governor YAML into deterministic canonical form + per-domain hashes.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn parse_governor_config_yaml(yaml: &str) -> Result<GovernorConfigEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut config: GovernorConfig = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid governor config YAML structure: {err}"))?;

    validate_governor_config(&config)?;
    normalize_governor_config(&mut config);
    validate_governor_config(&config)?;

    let mut domains = Vec::with_capacity(config.domains.len());
    for domain_config in config.domains {
        let config_hash = hash_json(&serde_json::to_value(&domain_config)?)?;
        domains.push(DomainConfigEnvelope {
            config_hash,
            config: domain_config,
        });
    }

    Ok(GovernorConfigEnvelope {
        source_yaml_hash,
        normalization_version: CONFIG_NORMALIZATION_VERSION,
        services: config.services,
        domains,
    })
}

fn validate_governor_config(config: &GovernorConfig) -> Result<()> {
    if config.domains.is_empty() {
        return Err(anyhow!("governor config MUST register at least one domain"));
    }

    let mut domain_names = BTreeSet::new();
    for domain_config in &config.domains {
        validate_domain_config(domain_config)?;
        if !domain_names.insert(domain_config.domain.clone()) {
            return Err(anyhow!("duplicate domain: {}", domain_config.domain));
        }
    }

    if let Some(gate) = &config.services.gate {
        validate_service(gate, "services.gate")?;
    }
    if let Some(relay) = &config.services.relay {
        validate_service(relay, "services.relay")?;
    }

    Ok(())
}

fn validate_domain_config(config: &DomainConfig) -> Result<()> {
    ensure_non_empty("domain", config.domain.as_str())?;

    // Constraint order is semantic; only name uniqueness is enforced.
    let mut names = BTreeSet::new();
    for rule in config.constraints.iter() {
        ensure_non_empty("constraint name", &rule.name)?;
        if !names.insert(rule.name.clone()) {
            return Err(anyhow!(
                "domain {} declares duplicate constraint: {}",
                config.domain,
                rule.name
            ));
        }
    }

    if config.limits.validate_attempts == 0 {
        return Err(anyhow!(
            "domain {} limits.validate_attempts MUST be at least 1",
            config.domain
        ));
    }
    if config.limits.audit_attempts == 0 {
        return Err(anyhow!(
            "domain {} limits.audit_attempts MUST be at least 1",
            config.domain
        ));
    }
    if config.limits.execute_fan_out == 0 {
        return Err(anyhow!(
            "domain {} limits.execute_fan_out MUST be at least 1",
            config.domain
        ));
    }

    Ok(())
}

fn validate_service(service: &HttpServiceConfig, field_name: &str) -> Result<()> {
    ensure_non_empty(&format!("{field_name}.url"), &service.url)?;
    if service.timeout_ms == 0 {
        return Err(anyhow!("{field_name}.timeout_ms MUST be at least 1"));
    }
    Ok(())
}

fn normalize_governor_config(config: &mut GovernorConfig) {
    for domain_config in &mut config.domains {
        domain_config.domain = Domain(domain_config.domain.as_str().trim().to_string());
        if let Some(summary) = &mut domain_config.summary {
            *summary = summary.trim().to_string();
        }
        // Constraints are an ordered set: trim names, never sort or dedup.
        for rule in &mut domain_config.constraints.0 {
            rule.name = rule.name.trim().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_governor_config_yaml;

    const FIXTURE_YAML: &str = r#"
services:
  gate:
    url: "https://gate.internal/validate"
    timeout_ms: 5000
domains:
  - domain: lma
    summary: "lma weekly cleanup"
    constraints:
      - name: no_default_branch_deletes
      - name: max_batch_size
        params:
          limit: 10
    limits:
      validate_attempts: 3
      backoff_base_ms: 100
  - domain: ops
"#;

    #[test]
    fn parse_produces_stable_domain_hashes() {
        let first = parse_governor_config_yaml(FIXTURE_YAML);
        let second = parse_governor_config_yaml(FIXTURE_YAML);
        assert!(first.is_ok());
        assert!(second.is_ok());
        match (first, second) {
            (Ok(first), Ok(second)) => {
                assert_eq!(first.domains.len(), 2);
                assert_eq!(first.domains[0].config_hash, second.domains[0].config_hash);
                assert_eq!(first.source_yaml_hash, second.source_yaml_hash);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn constraint_order_is_preserved() {
        let envelope = parse_governor_config_yaml(FIXTURE_YAML);
        assert!(envelope.is_ok());
        let envelope = envelope.unwrap_or_else(|_| unreachable!());
        let lma = envelope.domain("lma");
        assert!(lma.is_some());
        let lma = lma.unwrap_or_else(|| unreachable!());
        assert_eq!(
            lma.config.constraints.names(),
            vec!["no_default_branch_deletes", "max_batch_size"]
        );
    }

    #[test]
    fn defaults_fill_missing_limits() {
        let envelope = parse_governor_config_yaml(FIXTURE_YAML);
        assert!(envelope.is_ok());
        let envelope = envelope.unwrap_or_else(|_| unreachable!());
        let ops = envelope.domain("ops");
        assert!(ops.is_some());
        let ops = ops.unwrap_or_else(|| unreachable!());
        assert_eq!(ops.config.limits.validate_attempts, 3);
        assert_eq!(ops.config.limits.audit_attempts, 2);
        assert_eq!(ops.config.limits.execute_fan_out, 4);
    }

    #[test]
    fn duplicate_domains_are_rejected() {
        let yaml = r"
domains:
  - domain: lma
  - domain: lma
";
        assert!(parse_governor_config_yaml(yaml).is_err());
    }

    #[test]
    fn duplicate_constraint_names_are_rejected() {
        let yaml = r"
domains:
  - domain: lma
    constraints:
      - name: no_default_branch_deletes
      - name: no_default_branch_deletes
";
        assert!(parse_governor_config_yaml(yaml).is_err());
    }

    #[test]
    fn empty_registry_is_rejected() {
        let yaml = r"
domains: []
";
        assert!(parse_governor_config_yaml(yaml).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = r"
domains:
  - domain: lma
    unexpected: true
";
        assert!(parse_governor_config_yaml(yaml).is_err());
    }
}
