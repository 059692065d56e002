use crate::{tunnel_params, Contribution, ProducerConfig};
use cloudflared_tunnel_controller_core::{
    annotations,
    config::{IngressRule, OriginRequest},
    mapping::{parse_class_ingress_mapping, parse_stack_ingress_mapping, Schema},
    TunnelParams,
};
use cloudflared_tunnel_controller_k8s_api::{api::networking::v1 as networking, Ingress, ResourceExt};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub(crate) const KIND: &str = "ingress";

/// Derives the rules an Ingress contributes, if it is served by a tunnel.
///
/// Ingresses of the configured class expose their own host and path rules;
/// the tunnel is named by annotation or taken from the hosts' common parent
/// domain. Ingresses of any other class must name both the tunnel and an
/// explicit mapping.
pub fn ingress_rules(ingress: &Ingress, config: &ProducerConfig) -> Option<Contribution> {
    let class = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref());
    if class == Some(config.ingress_class.as_str()) {
        class_rules(ingress, config)
    } else {
        stack_rules(ingress, config)
    }
}

fn class_rules(ingress: &Ingress, config: &ProducerConfig) -> Option<Contribution> {
    let namespace = ingress.namespace().unwrap_or_default();
    let annos = ingress.annotations();
    let tunnel = match annos.get(annotations::TUNNEL_NAME) {
        Some(name) => tunnel_params(name, &config.tunnel_namespace),
        None => introspect_tunnel(ingress, &namespace)?,
    };
    let mappings = annos
        .get(annotations::TUNNEL_MAPPING)
        .map(|m| parse_class_ingress_mapping(m))
        .unwrap_or_default();

    let mut rules = Vec::new();
    for rule in hosts(ingress) {
        let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
            debug!(ingress = %ingress.name_any(), "Skipping rule without a host");
            continue;
        };
        for path in rule.http.iter().flat_map(|http| &http.paths) {
            let Some(backend) = path.backend.service.as_ref() else {
                continue;
            };
            let Some(port) = backend.port.as_ref().and_then(|p| p.number) else {
                warn!(ingress = %ingress.name_any(), %host, backend = %backend.name, "Backend port must be a number");
                continue;
            };
            let path = path.path.as_deref().filter(|p| !p.is_empty()).unwrap_or("/");
            let mapping = mappings
                .iter()
                .find(|m| m.hostname == host && m.path == path);
            let schema = mapping.map(|m| m.schema).unwrap_or_default();
            let host_header = mapping
                .and_then(|m| m.host_header.clone())
                .unwrap_or_else(|| host.to_string());
            rules.push(IngressRule {
                hostname: Some(host.to_string()),
                path: Some(path.to_string()),
                service: format!(
                    "{}://{}.{}:{}",
                    schema.url_scheme(),
                    backend.name,
                    namespace,
                    port
                ),
                origin_request: Some(origin(schema, host_header)),
            });
        }
    }
    Some(Contribution { tunnel, rules })
}

fn stack_rules(ingress: &Ingress, config: &ProducerConfig) -> Option<Contribution> {
    let annos = ingress.annotations();
    let name = annos.get(annotations::TUNNEL_NAME)?;
    let mapping = annos.get(annotations::TUNNEL_MAPPING)?;
    let rules = parse_stack_ingress_mapping(mapping)
        .into_iter()
        .map(|m| IngressRule {
            hostname: Some(m.ext_hostname),
            path: Some(m.path),
            service: format!("{}://{}:{}", m.schema.url_scheme(), m.hostname, m.intern_port),
            origin_request: Some(origin(m.schema, m.host_header.unwrap_or(m.hostname))),
        })
        .collect();
    Some(Contribution {
        tunnel: tunnel_params(name, &config.tunnel_namespace),
        rules,
    })
}

/// Names the tunnel after the parent domain every host shares, e.g.
/// `a.example.com` and `b.example.com` are served by `example.com`.
fn introspect_tunnel(ingress: &Ingress, namespace: &str) -> Option<TunnelParams> {
    let parents = hosts(ingress)
        .filter_map(|rule| rule.host.as_deref())
        .filter_map(|host| host.split_once('.').map(|(_, parent)| parent))
        .filter(|parent| !parent.is_empty())
        .collect::<BTreeSet<_>>();
    let mut parents = parents.into_iter();
    match (parents.next(), parents.next()) {
        (Some(parent), None) => Some(TunnelParams::new(namespace, parent)),
        (None, _) => {
            debug!(ingress = %ingress.name_any(), "No hosts to name a tunnel after");
            None
        }
        (Some(_), Some(_)) => {
            warn!(ingress = %ingress.name_any(), "Hosts do not share a parent domain");
            None
        }
    }
}

fn hosts(ingress: &Ingress) -> impl Iterator<Item = &networking::IngressRule> {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
}

fn origin(schema: Schema, host_header: String) -> OriginRequest {
    OriginRequest {
        http_host_header: Some(host_header),
        no_tls_verify: schema.no_tls_verify(),
    }
}
