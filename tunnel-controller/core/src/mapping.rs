//! Parsers for the human-written tunnel mapping annotations.
//!
//! Every parser is tolerant: malformed entries are logged and skipped.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::warn;

static META: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[((?:[^\[\]\\]|\\.)*)\]").expect("regex must compile"));

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Schema {
    #[default]
    Http,
    Https,
    /// HTTPS to the origin without certificate verification.
    HttpsNoTlsVerify,
}

/// `port[/schema][/path | |path]`, optionally carrying `[..]` meta sections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceMapping {
    pub port_name: String,
    pub schema: Schema,
    pub path: String,
    pub order: usize,
    pub meta: Vec<String>,
}

/// `hostname[/schema[/hostheader]][|path]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassIngressMapping {
    pub hostname: String,
    pub schema: Schema,
    pub host_header: Option<String>,
    pub path: String,
}

/// `schema/hostname/int-port/hostheader/ext-host[|path]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackIngressMapping {
    pub schema: Schema,
    pub hostname: String,
    pub intern_port: u16,
    pub host_header: Option<String>,
    pub ext_hostname: String,
    pub path: String,
}

// === impl Schema ===

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::HttpsNoTlsVerify => "https-notlsverify",
        }
    }

    /// The URL scheme used to reach the origin.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https | Self::HttpsNoTlsVerify => "https",
        }
    }

    pub fn no_tls_verify(&self) -> bool {
        matches!(self, Self::HttpsNoTlsVerify)
    }
}

impl std::str::FromStr for Schema {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "https-notlsverify" => Ok(Self::HttpsNoTlsVerify),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === parsers ===

fn entries(mapping: &str) -> impl Iterator<Item = &str> {
    mapping.split(',').map(str::trim)
}

fn strip_meta(entry: &str) -> (String, Vec<String>) {
    let meta = META
        .captures_iter(entry)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect();
    (META.replace_all(entry, "").into_owned(), meta)
}

pub fn parse_service_mapping(mapping: &str) -> Vec<ServiceMapping> {
    let mut out = Vec::new();
    for entry in entries(mapping) {
        let (entry, meta) = strip_meta(entry);
        let (port_name, rest) = match entry.split_once('/') {
            Some((port, rest)) => (port, Some(rest)),
            None => (entry.as_str(), None),
        };
        if port_name.is_empty() {
            warn!(%entry, "Invalid mapping: missing port");
            continue;
        }

        // The path is introduced by whichever of `|` or `/` comes first after
        // the schema. A `|` path is taken verbatim; a `/` path is normalized
        // to a single leading slash.
        let (schema, path) = match rest {
            None => ("", None),
            Some(rest) => match (rest.find('/'), rest.find('|')) {
                (Some(s), Some(p)) if p < s => (&rest[..p], Some(rest[p + 1..].to_string())),
                (None, Some(p)) => (&rest[..p], Some(rest[p + 1..].to_string())),
                (Some(s), _) => (
                    &rest[..s],
                    Some(format!("/{}", rest[s + 1..].trim_start_matches('/'))),
                ),
                (None, None) => (rest, None),
            },
        };

        let schema = if schema.is_empty() {
            Schema::Http
        } else {
            match schema.parse() {
                Ok(s) => s,
                Err(()) => {
                    warn!(%entry, %schema, "Invalid mapping: unknown schema");
                    continue;
                }
            }
        };

        out.push(ServiceMapping {
            port_name: port_name.to_string(),
            schema,
            path: path.unwrap_or_else(|| "/".to_string()),
            order: out.len(),
            meta,
        });
    }
    out
}

pub fn parse_class_ingress_mapping(mapping: &str) -> Vec<ClassIngressMapping> {
    let mut out = Vec::new();
    for entry in entries(mapping) {
        let (target, path) = match entry.split_once('|') {
            Some((target, path)) => (target, path),
            None => (entry, "/"),
        };
        let mut parts = target.splitn(3, '/');

        let hostname = parts.next().unwrap_or_default();
        if hostname.is_empty() {
            warn!(%entry, "Invalid mapping: missing hostname");
            continue;
        }

        let schema = match parts.next().filter(|s| !s.is_empty()) {
            None => Schema::Http,
            Some(s) => match s.parse() {
                Ok(s) => s,
                Err(()) => {
                    warn!(%entry, schema = %s, "Invalid mapping: unknown schema");
                    continue;
                }
            },
        };

        let host_header = parts.next().filter(|h| !h.is_empty()).map(Into::into);

        out.push(ClassIngressMapping {
            hostname: hostname.to_string(),
            schema,
            host_header,
            path: path.to_string(),
        });
    }
    out
}

pub fn parse_stack_ingress_mapping(mapping: &str) -> Vec<StackIngressMapping> {
    let mut out = Vec::new();
    for entry in entries(mapping) {
        let (target, path) = match entry.split_once('|') {
            Some((target, path)) => (target, path),
            None => (entry, "/"),
        };
        let parts = target.splitn(5, '/').collect::<Vec<_>>();

        let schema = match parts.first().filter(|s| !s.is_empty()) {
            None => Schema::Http,
            Some(s) => match s.parse() {
                Ok(s) => s,
                Err(()) => {
                    warn!(%entry, schema = %s, "Invalid mapping: unknown schema");
                    continue;
                }
            },
        };

        let hostname = match parts.get(1).filter(|h| !h.is_empty()) {
            Some(h) => h.to_string(),
            None => {
                warn!(%entry, "Invalid mapping: missing hostname");
                continue;
            }
        };

        let intern_port = match parts.get(2).filter(|p| !p.is_empty()) {
            None => 80,
            Some(p) => match p.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    warn!(%entry, port = %p, "Invalid mapping: invalid port");
                    continue;
                }
            },
        };

        let host_header = parts
            .get(3)
            .filter(|h| !h.is_empty())
            .map(|h| h.to_string());

        let ext_hostname = match parts.get(4).filter(|h| !h.is_empty()) {
            Some(h) => h.to_string(),
            None => {
                warn!(%entry, "Invalid mapping: missing external hostname");
                continue;
            }
        };

        out.push(StackIngressMapping {
            schema,
            hostname,
            intern_port,
            host_header,
            ext_hostname,
            path: path.to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn svc(port: &str, schema: Schema, path: &str, order: usize) -> ServiceMapping {
        ServiceMapping {
            port_name: port.to_string(),
            schema,
            path: path.to_string(),
            order,
            meta: vec![],
        }
    }

    fn paths(mapping: &str) -> Vec<String> {
        parse_service_mapping(mapping)
            .into_iter()
            .map(|m| m.path)
            .collect()
    }

    #[test]
    fn service_mapping_empty() {
        assert_eq!(parse_service_mapping(""), vec![]);
        assert_eq!(parse_service_mapping("//,/"), vec![]);
    }

    #[test]
    fn service_mapping_port_and_schema() {
        assert_eq!(
            parse_service_mapping("hallo"),
            vec![svc("hallo", Schema::Http, "/", 0)]
        );
        assert_eq!(
            parse_service_mapping("//,hallo,/"),
            vec![svc("hallo", Schema::Http, "/", 0)]
        );
        assert_eq!(parse_service_mapping("hallo/xxxx"), vec![]);
        assert_eq!(
            parse_service_mapping("xallo/xxxx/,hallo/http,murks/https"),
            vec![
                svc("hallo", Schema::Http, "/", 0),
                svc("murks", Schema::Https, "/", 1),
            ]
        );
        assert_eq!(
            parse_service_mapping("tls/https-notlsverify"),
            vec![svc("tls", Schema::HttpsNoTlsVerify, "/", 0)]
        );
    }

    #[rstest]
    #[case("hallo/http/////", "/")]
    #[case("hallo/http|||||||", "||||||")]
    #[case("hallo/http|", "")]
    #[case("hallo/http|meno/wurks", "meno/wurks")]
    #[case("hallo/http|||||||/////meno", "||||||/////meno")]
    #[case("hallo/http||||/////meno/wurks", "|||/////meno/wurks")]
    #[case("hallo/http/meno/wurks", "/meno/wurks")]
    #[case("hallo/http/////meno", "/meno")]
    #[case("hallo/http", "/")]
    #[case("hallo/http/meno/wurks/", "/meno/wurks/")]
    fn service_mapping_paths(#[case] mapping: &str, #[case] path: &str) {
        assert_eq!(paths(mapping), vec![path.to_string()]);
    }

    #[test]
    fn service_mapping_regex_paths() {
        assert_eq!(
            parse_service_mapping(
                r"public/http|^\/(assets|favicon|fonts|logo)\/,public/http|^\/manifest.json$,next/http/"
            ),
            vec![
                svc("public", Schema::Http, r"^\/(assets|favicon|fonts|logo)\/", 0),
                svc("public", Schema::Http, r"^\/manifest.json$", 1),
                svc("next", Schema::Http, "/", 2),
            ]
        );
    }

    #[test]
    fn service_mapping_multiline() {
        let mapping = "hallo/http/////  ,
            hallo/http|||/me/no ,
            hallo/http/meno ,
            hallo/http,
            hallo/http/meno/wurks/";
        let parsed = parse_service_mapping(mapping);
        assert_eq!(
            parsed.iter().map(|m| m.path.as_str()).collect::<Vec<_>>(),
            vec!["/", "||/me/no", "/meno", "/", "/meno/wurks/"]
        );
        assert_eq!(
            parsed.iter().map(|m| m.order).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn service_mapping_meta() {
        let parsed = parse_service_mapping("web[auth=sso]/https/app");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].port_name, "web");
        assert_eq!(parsed[0].schema, Schema::Https);
        assert_eq!(parsed[0].path, "/app");
        assert_eq!(parsed[0].meta, vec!["auth=sso".to_string()]);
    }

    #[test]
    fn class_ingress_mapping() {
        assert_eq!(
            parse_class_ingress_mapping("a.example.com/https/internal.a|/api, b.example.com"),
            vec![
                ClassIngressMapping {
                    hostname: "a.example.com".to_string(),
                    schema: Schema::Https,
                    host_header: Some("internal.a".to_string()),
                    path: "/api".to_string(),
                },
                ClassIngressMapping {
                    hostname: "b.example.com".to_string(),
                    schema: Schema::Http,
                    host_header: None,
                    path: "/".to_string(),
                },
            ]
        );
        assert_eq!(parse_class_ingress_mapping("/https|/x"), vec![]);
        assert_eq!(parse_class_ingress_mapping("a.example.com/ftp"), vec![]);
    }

    #[test]
    fn stack_ingress_mapping() {
        assert_eq!(
            parse_stack_ingress_mapping("https/svc.internal/8443/svc.host/svc.example.com|/v1"),
            vec![StackIngressMapping {
                schema: Schema::Https,
                hostname: "svc.internal".to_string(),
                intern_port: 8443,
                host_header: Some("svc.host".to_string()),
                ext_hostname: "svc.example.com".to_string(),
                path: "/v1".to_string(),
            }]
        );
        assert_eq!(
            parse_stack_ingress_mapping("/svc.internal///svc.example.com"),
            vec![StackIngressMapping {
                schema: Schema::Http,
                hostname: "svc.internal".to_string(),
                intern_port: 80,
                host_header: None,
                ext_hostname: "svc.example.com".to_string(),
                path: "/".to_string(),
            }]
        );
    }

    #[rstest]
    #[case("http/svc.internal/80/host")]
    #[case("http//80/host/ext.example.com")]
    #[case("http/svc.internal/0/host/ext.example.com")]
    #[case("http/svc.internal/70000/host/ext.example.com")]
    #[case("gopher/svc.internal/80/host/ext.example.com")]
    fn stack_ingress_mapping_rejects(#[case] mapping: &str) {
        assert_eq!(parse_stack_ingress_mapping(mapping), vec![]);
    }
}
