use crate::{
    cloudflared::CloudflaredCli,
    controller::Controller,
    core::{labels::Selector, Uuid, CONTROLLER_NAME},
    k8s::{self, KubeConfigMaps, KubeSources, ListOptions, Namespace, SecretCredentials},
    lease::{self, LeaseParams},
    producers::ProducerConfig,
    store::{Store, StoreConfig, StoreMetrics},
    supervisor::{
        PrepareConfig, SupervisorConfig, SupervisorMetrics, TunnelPreparer, TunnelRunner,
    },
};
use anyhow::{bail, Result};
use clap::Parser;
use cloudflared_tunnel_controller_k8s_watcher::{Params, Watcher};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::{sync::oneshot, time::Duration};
use tracing::{error, info, info_span, Instrument};

/// The cluster name used in tunnel display names.
const CLUSTER_NAME: &str = "k8s";

#[derive(Debug, Parser)]
#[clap(name = "cloudflared-controller", about = "Runs cloudflared tunnels for Kubernetes")]
pub struct Args {
    #[clap(
        long,
        default_value = "cloudflared=info,warn",
        env = "CLOUDFLARED_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespaces to watch. All namespaces are watched when empty.
    #[clap(
        short = 'n',
        long = "namespace",
        env = "CLOUDFLARED_CONTROLLER_NAMESPACES",
        value_delimiter = ','
    )]
    namespaces: Vec<String>,

    /// Label selecting the tunnel ConfigMaps owned by this controller.
    #[clap(long, default_value = "app=cloudflared-controller")]
    config_map_label: String,

    #[clap(long, default_value = "default")]
    tunnel_configmap_namespace: String,

    /// Ingresses of this class are served from their own rules.
    #[clap(long, default_value = "cloudflared")]
    ingress_class: String,

    /// Directory holding each running instance's files.
    #[clap(long, default_value = "./")]
    running_instance_dir: PathBuf,

    #[clap(long, default_value = "cloudflared")]
    cloudflared_fname: PathBuf,

    /// Only maintains tunnel configuration; no tunnel agents are run.
    #[clap(long)]
    no_cloudflared: bool,

    /// Keeps instance directories after their agent stops.
    #[clap(long)]
    debug: bool,

    #[clap(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    account_id: String,

    /// Lease holder identity. Defaults to the pod's hostname.
    #[clap(long, env = "POD_NAME")]
    identity: Option<String>,

    #[clap(long, default_value = CONTROLLER_NAME)]
    leader_name: String,

    #[clap(long, default_value = "default")]
    leader_namespace: String,

    #[clap(long, default_value = "15s", value_parser = parse_secs)]
    leader_lease_duration: Duration,

    #[clap(long, default_value = "2s", value_parser = parse_secs)]
    leader_renew_grace_period: Duration,

    #[clap(long, default_value = "5s", value_parser = parse_secs)]
    watch_restart_delay: Duration,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespaces,
            config_map_label,
            tunnel_configmap_namespace,
            ingress_class,
            running_instance_dir,
            cloudflared_fname,
            no_cloudflared,
            debug,
            account_id,
            identity,
            leader_name,
            leader_namespace,
            leader_lease_duration,
            leader_renew_grace_period,
            watch_restart_delay,
        } = self;

        let selector = Selector::parse_or_default(&config_map_label);
        let identity = identity
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut prom = <Registry>::default();
        let store_metrics = StoreMetrics::register(prom.sub_registry_with_prefix("store"));
        let supervisor_metrics =
            SupervisorMetrics::register(prom.sub_registry_with_prefix("supervisor"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let claims = lease::init(
            &runtime,
            &LeaseParams {
                name: leader_name,
                namespace: leader_namespace,
                identity: identity.clone(),
                lease_duration: leader_lease_duration,
                renew_grace_period: leader_renew_grace_period,
            },
        )
        .await?;

        let store = Store::new(
            Arc::new(KubeConfigMaps::new(runtime.client())),
            StoreConfig {
                selector: selector.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                namespaces: namespaces.clone(),
                restart_delay: watch_restart_delay,
                metrics: store_metrics,
            },
        );
        let producers = ProducerConfig {
            ingress_class,
            tunnel_namespace: tunnel_configmap_namespace.clone(),
            namespaces,
            restart_delay: watch_restart_delay,
        };

        let credentials = Arc::new(SecretCredentials::new(
            runtime.client(),
            account_id.clone(),
            CLUSTER_NAME.to_string(),
            [(selector.key, selector.value)].into_iter().collect(),
        ));
        let provider = Arc::new(CloudflaredCli::new(cloudflared_fname.clone()));
        let preparer = Arc::new(TunnelPreparer::new(
            store.clone(),
            credentials.clone(),
            provider.clone(),
            PrepareConfig {
                account: account_id,
                cluster: CLUSTER_NAME.to_string(),
            },
        ));

        let runner = if no_cloudflared {
            info!("Tunnel agents are disabled");
            None
        } else {
            let runner = TunnelRunner::new(
                SupervisorConfig {
                    root: running_instance_dir,
                    cloudflared: cloudflared_fname,
                    default_namespace: tunnel_configmap_namespace,
                    preserve: debug,
                },
                credentials,
                provider,
                supervisor_metrics,
            );
            Some(Arc::new(runner))
        };

        let namespaces = Watcher::new(
            Arc::new(k8s::Api::<Namespace>::all(runtime.client())),
            Params {
                opts: ListOptions::default(),
                restart_delay: watch_restart_delay,
            },
        );

        let controller = Controller {
            namespaces,
            store,
            sources: Arc::new(KubeSources::new(runtime.client())),
            producers,
            preparer,
            runner,
            identity,
            restart_delay: watch_restart_delay,
        };
        let (lost_tx, lost_rx) = oneshot::channel();
        let drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if let Err(error) = controller.run(claims, drain).await {
                    error!(%error, "Controller stopped");
                    let _ = lost_tx.send(error);
                }
            }
            .instrument(info_span!("controller")),
        );

        // Block on the shutdown signal, then wait for the controller to stop
        // its tunnels before exiting.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            Ok(error) = lost_rx => return Err(error),
        }

        Ok(())
    }
}

fn parse_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
    let secs = s.trim().strip_suffix('s').unwrap_or(s.trim());
    secs.parse().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "cloudflared-controller",
            "--account-id=acct",
            "-n",
            "team-a,team-b",
            "--namespace=team-c",
            "--debug",
            "--ingress-class=tunnel",
            "--leader-lease-duration=30",
            "--watch-restart-delay=1s",
        ])
        .expect("flags must parse");
        assert_eq!(args.namespaces, ["team-a", "team-b", "team-c"]);
        assert_eq!(args.account_id, "acct");
        assert!(args.debug);
        assert_eq!(args.ingress_class, "tunnel");
        assert_eq!(args.tunnel_configmap_namespace, "default");
        assert!(!args.no_cloudflared);
        assert_eq!(args.leader_name, CONTROLLER_NAME);
        assert_eq!(args.leader_lease_duration, Duration::from_secs(30));
        assert_eq!(args.leader_renew_grace_period, Duration::from_secs(2));
        assert_eq!(args.watch_restart_delay, Duration::from_secs(1));
        assert_eq!(args.running_instance_dir, PathBuf::from("./"));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_secs("5m").is_err());
        assert!(parse_secs("").is_err());
        assert_eq!(parse_secs(" 7s ").unwrap(), Duration::from_secs(7));
    }
}
