use crate::{service_rules, Contribution, ProducerConfig};
use cloudflared_tunnel_controller_core::{
    annotations,
    config::{IngressRule, OriginRequest},
    TunnelParams,
};
use cloudflared_tunnel_controller_k8s_api::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
    ObjectMeta,
};
use maplit::btreemap;
use pretty_assertions::assert_eq;

#[test]
fn mapping_selects_ports_by_name() {
    let svc = what_tech(
        Some("https/https-notlsverify/,http/http/doof"),
        vec![
            port("http", 1480, IntOrString::Int(8080)),
            port("https", 1443, IntOrString::Int(8443)),
        ],
    );

    let Contribution { tunnel, rules } = service_rules(&svc, &config()).unwrap();
    assert_eq!(tunnel, TunnelParams::new("what", "what.tech"));
    assert_eq!(
        rules,
        vec![
            IngressRule {
                hostname: Some("cft.what.tech".to_string()),
                path: Some("/".to_string()),
                service: "https://what-tech.what:1443".to_string(),
                origin_request: Some(OriginRequest {
                    http_host_header: Some("what-tech".to_string()),
                    no_tls_verify: true,
                }),
            },
            IngressRule {
                hostname: Some("cft.what.tech".to_string()),
                path: Some("/doof".to_string()),
                service: "http://what-tech.what:1480".to_string(),
                origin_request: Some(OriginRequest {
                    http_host_header: Some("what-tech".to_string()),
                    no_tls_verify: false,
                }),
            },
        ]
    );
}

#[test]
fn mapped_ports_must_exist() {
    let svc = what_tech(
        Some("grpc/https,http"),
        vec![port("http", 1480, IntOrString::Int(8080))],
    );
    let Contribution { rules, .. } = service_rules(&svc, &config()).unwrap();
    assert_eq!(services(&rules), vec!["http://what-tech.what:1480"]);
}

#[test]
fn unmapped_service_prefers_port_names() {
    let svc = what_tech(
        None,
        vec![
            port("http", 80, IntOrString::String("http".to_string())),
            port("https", 443, IntOrString::String("https".to_string())),
        ],
    );
    let Contribution { rules, .. } = service_rules(&svc, &config()).unwrap();
    assert_eq!(services(&rules), vec!["https://what-tech.what:443"]);

    // A port named `http` beats a target port named `https`.
    let svc = what_tech(
        None,
        vec![
            port("http", 80, IntOrString::String("http".to_string())),
            port("httpx", 443, IntOrString::String("https".to_string())),
        ],
    );
    let Contribution { rules, .. } = service_rules(&svc, &config()).unwrap();
    assert_eq!(services(&rules), vec!["http://what-tech.what:80"]);
}

#[test]
fn unmapped_service_falls_back_to_target_ports() {
    let svc = what_tech(
        None,
        vec![
            port("xhttp", 80, IntOrString::String("http".to_string())),
            port("xhttps", 443, IntOrString::String("https".to_string())),
        ],
    );
    let Contribution { rules, .. } = service_rules(&svc, &config()).unwrap();
    assert_eq!(services(&rules), vec!["https://what-tech.what:443"]);

    let svc = what_tech(
        None,
        vec![
            port("a", 8080, IntOrString::Int(80)),
            port("b", 8443, IntOrString::Int(443)),
        ],
    );
    let Contribution { rules, .. } = service_rules(&svc, &config()).unwrap();
    assert_eq!(services(&rules), vec!["https://what-tech.what:8443"]);

    let svc = what_tech(
        None,
        vec![
            port("a", 8080, IntOrString::Int(80)),
            port("b", 9090, IntOrString::Int(90)),
        ],
    );
    let Contribution { rules, .. } = service_rules(&svc, &config()).unwrap();
    assert_eq!(services(&rules), vec!["http://what-tech.what:8080"]);
}

#[test]
fn unknown_ports_contribute_nothing() {
    let svc = what_tech(
        None,
        vec![
            port("a", 80, IntOrString::Int(180)),
            port("b", 443, IntOrString::Int(1443)),
        ],
    );
    let Contribution { rules, .. } = service_rules(&svc, &config()).unwrap();
    assert!(rules.is_empty());
}

#[test]
fn services_need_tunnel_and_external_name() {
    let ports = vec![port("http", 80, IntOrString::Int(80))];

    let mut svc = what_tech(None, ports.clone());
    svc.metadata
        .annotations
        .as_mut()
        .unwrap()
        .remove(annotations::TUNNEL_EXTERNAL_NAME);
    assert_eq!(service_rules(&svc, &config()), None);

    let mut svc = what_tech(None, ports);
    svc.metadata
        .annotations
        .as_mut()
        .unwrap()
        .remove(annotations::TUNNEL_NAME);
    assert_eq!(service_rules(&svc, &config()), None);
}

fn config() -> ProducerConfig {
    ProducerConfig {
        tunnel_namespace: "what".to_string(),
        ..Default::default()
    }
}

fn services(rules: &[IngressRule]) -> Vec<&str> {
    rules.iter().map(|r| r.service.as_str()).collect()
}

fn what_tech(mapping: Option<&str>, ports: Vec<ServicePort>) -> Service {
    let mut annos = btreemap! {
        annotations::TUNNEL_NAME.to_string() => "what.tech".to_string(),
        annotations::TUNNEL_EXTERNAL_NAME.to_string() => "cft.what.tech".to_string(),
    };
    if let Some(mapping) = mapping {
        annos.insert(annotations::TUNNEL_MAPPING.to_string(), mapping.to_string());
    }
    Service {
        metadata: ObjectMeta {
            namespace: Some("what".to_string()),
            name: Some("what-tech".to_string()),
            annotations: Some(annos),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port(name: &str, port: i32, target: IntOrString) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(target),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}
