//! The tunnel agent's declarative `config.yaml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The service answering every request no other rule matched. The agent
/// requires the last ingress rule to be a catch-all.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,

    #[serde(
        default,
        rename = "noTLSVerify",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub no_tls_verify: bool,
}

/// One ingress rule contributed by a producer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    pub service: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub tunnel: String,

    #[serde(rename = "credentials-file")]
    pub credentials_file: PathBuf,

    pub ingress: Vec<IngressRule>,
}

// === impl IngressRule ===

impl IngressRule {
    pub fn catch_all() -> Self {
        Self {
            service: CATCH_ALL_SERVICE.to_string(),
            ..Default::default()
        }
    }

    /// The external hostname that needs a DNS route, if any.
    pub fn routed_hostname(&self) -> Option<&str> {
        self.hostname.as_deref().filter(|h| !h.is_empty())
    }

    /// Serializes a producer's rules into the fragment format stored in an
    /// artifact.
    pub fn to_fragment(rules: &[Self]) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(rules)
    }

    pub fn from_fragment(fragment: &str) -> Result<Vec<Self>, serde_yaml::Error> {
        serde_yaml::from_str(fragment)
    }
}

// === impl TunnelConfig ===

impl TunnelConfig {
    /// Builds a config from the given rules, appending the catch-all rule.
    pub fn new(
        tunnel: impl Into<String>,
        credentials_file: impl Into<PathBuf>,
        rules: impl IntoIterator<Item = IngressRule>,
    ) -> Self {
        let mut ingress = rules
            .into_iter()
            .filter(|r| r.service != CATCH_ALL_SERVICE || r.hostname.is_some())
            .collect::<Vec<_>>();
        ingress.push(IngressRule::catch_all());
        Self {
            tunnel: tunnel.into(),
            credentials_file: credentials_file.into(),
            ingress,
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule(hostname: &str, path: &str, service: &str) -> IngressRule {
        IngressRule {
            hostname: Some(hostname.to_string()),
            path: Some(path.to_string()),
            service: service.to_string(),
            origin_request: None,
        }
    }

    #[test]
    fn catch_all_is_last() {
        let config = TunnelConfig::new(
            "tid",
            "/run/x/credentials.json",
            vec![
                rule("a.example.com", "/", "http://svc-a:80"),
                IngressRule::catch_all(),
                rule("b.example.com", "/", "http://svc-b:80"),
            ],
        );
        assert_eq!(config.ingress.len(), 3);
        assert_eq!(config.ingress.last(), Some(&IngressRule::catch_all()));
    }

    #[test]
    fn yaml_field_names() {
        let mut r = rule("a.example.com", "/", "https://svc-a:443");
        r.origin_request = Some(OriginRequest {
            http_host_header: Some("internal.a".to_string()),
            no_tls_verify: true,
        });
        let yaml = TunnelConfig::new("tid", "/tmp/credentials.json", vec![r])
            .to_yaml()
            .unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["tunnel"].as_str(), Some("tid"));
        assert_eq!(
            value["credentials-file"].as_str(),
            Some("/tmp/credentials.json")
        );
        assert_eq!(
            value["ingress"][0]["originRequest"]["httpHostHeader"].as_str(),
            Some("internal.a")
        );
        assert_eq!(
            value["ingress"][0]["originRequest"]["noTLSVerify"].as_bool(),
            Some(true)
        );
        assert_eq!(
            value["ingress"][1]["service"].as_str(),
            Some(CATCH_ALL_SERVICE)
        );
        assert!(value["ingress"][1]["hostname"].is_null());
    }

    #[test]
    fn fragments_parse_back() {
        let rules = vec![
            rule("a.example.com", "/", "http://svc-a:80"),
            rule("a.example.com", "/api", "http://svc-b:8080"),
        ];
        let fragment = IngressRule::to_fragment(&rules).unwrap();
        assert_eq!(IngressRule::from_fragment(&fragment).unwrap(), rules);
    }

    #[test]
    fn routed_hostname_skips_empty() {
        assert_eq!(IngressRule::catch_all().routed_hostname(), None);
        assert_eq!(rule("", "/", "http://x").routed_hostname(), None);
        assert_eq!(
            rule("a.example.com", "/", "http://x").routed_hostname(),
            Some("a.example.com")
        );
    }
}
