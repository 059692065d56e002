mod service;

use self::fake::{FakeObjects, FakeSources};
use crate::{ProducerConfig, Producers};
use cloudflared_tunnel_controller_core::{
    annotations,
    config::{IngressRule, OriginRequest},
    fragment_key, ResourceName, TunnelParams,
};
use cloudflared_tunnel_controller_k8s_api::{
    api::core::v1::{ServicePort, ServiceSpec},
    ConfigMap, Namespace, ObjectMeta, Service,
};
use cloudflared_tunnel_controller_k8s_store::{Store, StoreConfig};
use cloudflared_tunnel_controller_k8s_watcher::{Params, Watcher};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::{future::Future, sync::Arc};
use tokio::time;

const APPS: &str = "apps";
const TUNNELS: &str = "default";

#[tokio::test]
async fn annotated_services_are_upserted_and_withdrawn() {
    let fx = Fixture::start().await;

    fx.sources.services.apply(web_service("web"));
    let key = fragment_key("service", APPS, "api");
    fx.eventually(|cms| fragments(cms, "web").contains(&key))
        .await;

    let cm = fx.artifact("web").expect("artifact must exist");
    let data = cm.data.expect("artifact must hold fragments");
    assert_eq!(
        IngressRule::from_fragment(&data[&key]).unwrap(),
        vec![IngressRule {
            hostname: Some("api.example.com".to_string()),
            path: Some("/".to_string()),
            service: "http://api.apps:8080".to_string(),
            origin_request: Some(OriginRequest {
                http_host_header: Some("api".to_string()),
                no_tls_verify: false,
            }),
        }]
    );

    fx.sources
        .services
        .delete(&ResourceName::new(APPS, "api"));
    fx.eventually(|cms| !fragments(cms, "web").contains(&key))
        .await;
}

#[tokio::test]
async fn unchanged_rules_are_not_rewritten() {
    let fx = Fixture::start().await;

    fx.sources.services.apply(web_service("web"));
    let key = fragment_key("service", APPS, "api");
    fx.eventually(|cms| fragments(cms, "web").contains(&key))
        .await;
    let writes = fx.config_maps.writes();

    // A status-only update derives the same rules.
    fx.sources.services.apply(web_service("web"));

    // Changes are applied in order, so once a later service lands the
    // repeated one has been handled.
    let mut other = web_service("web");
    other.metadata.name = Some("other".to_string());
    fx.sources.services.apply(other);
    let other_key = fragment_key("service", APPS, "other");
    fx.eventually(|cms| fragments(cms, "web").contains(&other_key))
        .await;

    assert_eq!(fx.config_maps.writes(), writes + 1);
}

#[tokio::test]
async fn moved_producers_leave_their_old_tunnel() {
    let fx = Fixture::start().await;

    fx.sources.services.apply(web_service("web"));
    let key = fragment_key("service", APPS, "api");
    fx.eventually(|cms| fragments(cms, "web").contains(&key))
        .await;

    fx.sources.services.apply(web_service("blog"));
    fx.eventually(|cms| {
        fragments(cms, "blog").contains(&key) && !fragments(cms, "web").contains(&key)
    })
    .await;
}

#[tokio::test]
async fn services_without_rules_remove_their_fragment() {
    let fx = Fixture::start().await;

    fx.sources.services.apply(web_service("web"));
    let key = fragment_key("service", APPS, "api");
    fx.eventually(|cms| fragments(cms, "web").contains(&key))
        .await;

    // Without a web port, the service contributes nothing.
    let mut svc = web_service("web");
    svc.spec = Some(ServiceSpec {
        ports: Some(vec![port("grpc", 9000)]),
        ..Default::default()
    });
    fx.sources.services.apply(svc);
    fx.eventually(|cms| !fragments(cms, "web").contains(&key))
        .await;
}

#[tokio::test]
async fn unwatched_namespaces_withdraw_their_rules() {
    let fx = Fixture::start().await;

    fx.sources.services.apply(web_service("web"));
    let key = fragment_key("service", APPS, "api");
    fx.eventually(|cms| fragments(cms, "web").contains(&key))
        .await;

    fx.producers.unwatch_namespace(APPS).await;
    assert!(fx.producers.watched_namespaces().await.is_empty());
    fx.eventually(|cms| !fragments(cms, "web").contains(&key))
        .await;
}

#[tokio::test]
async fn preset_namespaces_limit_watches() {
    let config_maps = Arc::new(FakeObjects::<ConfigMap>::default());
    let store = Store::new(config_maps, StoreConfig::default());
    let (producers, _task) = Producers::spawn(
        store,
        Arc::new(FakeSources::default()),
        ProducerConfig {
            namespaces: vec!["team-a".to_string()],
            ..Default::default()
        },
    );

    producers.watch_namespace("team-b").await.unwrap();
    producers.watch_namespace("team-a").await.unwrap();
    producers.watch_namespace("team-a").await.unwrap();
    assert_eq!(producers.watched_namespaces().await, vec!["team-a"]);
}

#[tokio::test]
async fn follows_namespace_lifecycle() {
    let fx = Fixture::start().await;
    fx.producers.unwatch_namespace(APPS).await;

    let namespaces = Arc::new(FakeObjects::<Namespace>::default());
    namespaces.apply(namespace("team-a"));
    let watcher = Watcher::new(namespaces.namespaced(""), Params::default());
    watcher.start().await.unwrap();
    let (follow, task) = fx.producers.follow_namespaces(&watcher);
    let producers = &fx.producers;

    eventually(|| async move { producers.watched_namespaces().await == ["team-a"] }).await;

    namespaces.apply(namespace("team-b"));
    eventually(|| async move { producers.watched_namespaces().await == ["team-a", "team-b"] })
        .await;

    namespaces.delete(&ResourceName::new("", "team-a"));
    eventually(|| async move { producers.watched_namespaces().await == ["team-b"] }).await;

    follow.unregister();
    time::timeout(time::Duration::from_secs(5), task)
        .await
        .expect("namespace task must complete")
        .unwrap();
    watcher.stop().await;
}

#[tokio::test]
async fn shutdown_completes_after_queued_changes() {
    let fx = Fixture::start().await;

    fx.sources.services.apply(web_service("web"));
    let key = fragment_key("service", APPS, "api");
    fx.eventually(|cms| fragments(cms, "web").contains(&key))
        .await;

    // Withdrawing queues a removal that must still be applied.
    let Fixture {
        producers,
        task,
        config_maps,
        ..
    } = fx;
    producers.unwatch_namespace(APPS).await;
    producers.shutdown().await;

    time::timeout(time::Duration::from_secs(5), task)
        .await
        .expect("apply task must complete")
        .unwrap();
    assert!(!fragments(&config_maps, "web").contains(&key));

    // Watches requested after shutdown are ignored.
    producers.watch_namespace(APPS).await.unwrap();
    assert!(producers.watched_namespaces().await.is_empty());
}

// === fixtures ===

struct Fixture {
    config_maps: Arc<FakeObjects<ConfigMap>>,
    sources: Arc<FakeSources>,
    producers: Producers,
    task: tokio::task::JoinHandle<()>,
}

impl Fixture {
    async fn start() -> Self {
        let config_maps = Arc::new(FakeObjects::<ConfigMap>::default());
        let store = Store::new(config_maps.clone(), StoreConfig::default());
        store.watch_namespace(TUNNELS).await.unwrap();

        let sources = Arc::new(FakeSources::default());
        let (producers, task) = Producers::spawn(
            store,
            sources.clone(),
            ProducerConfig {
                tunnel_namespace: TUNNELS.to_string(),
                ..Default::default()
            },
        );
        producers.watch_namespace(APPS).await.unwrap();
        Self {
            config_maps,
            sources,
            producers,
            task,
        }
    }

    fn artifact(&self, tunnel: &str) -> Option<ConfigMap> {
        self.config_maps
            .get_object(&TunnelParams::new(TUNNELS, tunnel).config_map_name())
    }

    async fn eventually(&self, f: impl Fn(&FakeObjects<ConfigMap>) -> bool) {
        let (f, cms) = (&f, &*self.config_maps);
        eventually(|| async move { f(cms) }).await
    }
}

async fn eventually<F, Fut>(f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    time::timeout(time::Duration::from_secs(5), async {
        while !f().await {
            time::sleep(time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition must hold within 5s")
}

fn fragments(cms: &FakeObjects<ConfigMap>, tunnel: &str) -> Vec<String> {
    cms.get_object(&TunnelParams::new(TUNNELS, tunnel).config_map_name())
        .and_then(|cm| cm.data)
        .map(|data| data.into_keys().collect())
        .unwrap_or_default()
}

/// `apps/api`, served at `api.example.com` through `tunnel`.
fn web_service(tunnel: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(APPS.to_string()),
            name: Some("api".to_string()),
            annotations: Some(btreemap! {
                annotations::TUNNEL_NAME.to_string() => tunnel.to_string(),
                annotations::TUNNEL_EXTERNAL_NAME.to_string() => "api.example.com".to_string(),
            }),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![port("http", 8080)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        ..Default::default()
    }
}

fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}
