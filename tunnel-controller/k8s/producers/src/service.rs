use crate::{tunnel_params, Contribution, ProducerConfig};
use cloudflared_tunnel_controller_core::{
    annotations,
    config::{IngressRule, OriginRequest},
    mapping::{parse_service_mapping, Schema},
};
use cloudflared_tunnel_controller_k8s_api::{
    api::core::v1::ServicePort, apimachinery::pkg::util::intstr::IntOrString, ResourceExt,
    Service,
};
use tracing::{debug, warn};

pub(crate) const KIND: &str = "service";

/// Derives the rules a Service contributes, if it names a tunnel and an
/// external hostname.
///
/// With a mapping, each mapped port gets its own rule. Otherwise a single
/// rule is derived from the port that looks most like HTTPS or HTTP.
pub fn service_rules(svc: &Service, config: &ProducerConfig) -> Option<Contribution> {
    let annos = svc.annotations();
    let tunnel = annos.get(annotations::TUNNEL_NAME)?;
    let external = annos.get(annotations::TUNNEL_EXTERNAL_NAME)?;
    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_default();
    let ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();

    let rule = |schema: Schema, path: &str, port: i32| IngressRule {
        hostname: Some(external.clone()),
        path: Some(path.to_string()),
        service: format!("{}://{}.{}:{}", schema.url_scheme(), name, namespace, port),
        origin_request: Some(OriginRequest {
            http_host_header: Some(name.clone()),
            no_tls_verify: schema.no_tls_verify(),
        }),
    };

    let rules = match annos.get(annotations::TUNNEL_MAPPING) {
        Some(mapping) => parse_service_mapping(mapping)
            .iter()
            .filter_map(|m| {
                let port_name = Some(m.port_name.as_str());
                let Some(port) = ports.iter().find(|p| p.name.as_deref() == port_name) else {
                    warn!(service = %name, port = %m.port_name, "Mapped port not found");
                    return None;
                };
                Some(rule(m.schema, &m.path, port.port))
            })
            .collect(),
        None => match web_port(ports) {
            Some((schema, port)) => vec![rule(schema, "/", port)],
            None => {
                debug!(service = %name, "No web port");
                Vec::new()
            }
        },
    };

    Some(Contribution {
        tunnel: tunnel_params(tunnel, &config.tunnel_namespace),
        rules,
    })
}

/// Picks the port to expose. Port names are trusted over target port names,
/// which are trusted over well-known target port numbers.
fn web_port(ports: &[ServicePort]) -> Option<(Schema, i32)> {
    let named = |schema: Schema| {
        ports
            .iter()
            .find(|p| p.name.as_deref() == Some(schema.as_str()))
    };
    let target = |want: &IntOrString| ports.iter().find(|p| p.target_port.as_ref() == Some(want));

    let candidates = [
        (Schema::Https, named(Schema::Https)),
        (Schema::Http, named(Schema::Http)),
        (Schema::Https, target(&IntOrString::String("https".to_string()))),
        (Schema::Http, target(&IntOrString::String("http".to_string()))),
        (Schema::Https, target(&IntOrString::Int(443))),
        (Schema::Http, target(&IntOrString::Int(80))),
    ];
    candidates
        .into_iter()
        .find_map(|(schema, port)| port.map(|p| (schema, p.port)))
}
