use crate::{runner::Context, Error, SupervisorMetrics};
use cloudflared_tunnel_controller_core::{
    annotations,
    config::{IngressRule, TunnelConfig},
    provider::ProviderError,
    InstanceId, ResourceName, TunnelParams, Uuid,
};
use cloudflared_tunnel_controller_k8s_store::Artifact;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const CREDENTIALS_FILE: &str = "credentials.json";
const CONFIG_FILE: &str = "config.yaml";

/// Decoded rules keyed by fragment key.
pub(crate) type Source = BTreeMap<String, Vec<IngressRule>>;

/// One tunnel agent process and the private directory it runs from.
pub(crate) struct RunningInstance {
    pub(crate) id: InstanceId,
    pub(crate) source: Source,
    pub(crate) dir: PathBuf,
    pub(crate) pid: Option<u32>,
    kill: CancellationToken,
    reaper: Option<JoinHandle<()>>,
    exited: Arc<AtomicBool>,
}

// === impl RunningInstance ===

impl RunningInstance {
    pub(crate) async fn start(
        ctx: &Context,
        artifact: &Artifact,
        id: InstanceId,
        source: Source,
    ) -> Result<Self, Error> {
        let tunnel_id = artifact
            .annotation(annotations::TUNNEL_ID)
            .ok_or(Error::MissingAnnotation(annotations::TUNNEL_ID))?;
        let tunnel_id = Uuid::parse_str(tunnel_id)
            .map_err(|_| Error::InvalidTunnelId(tunnel_id.to_string()))?;
        let secret = secret_name(artifact, &ctx.config.default_namespace)?;

        // The agent runs from inside its instance directory, so every path
        // handed to it must be absolute.
        let root = std::path::absolute(&ctx.config.root).map_err(io(&ctx.config.root))?;
        let parent = root.join(&artifact.namespace).join(&artifact.name);
        fs::create_dir_all(&parent).await.map_err(io(&parent))?;
        let dir = parent.join(id.as_str());
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        match builder.create(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyRunning(dir));
            }
            Err(e) => return Err(io(&dir)(e)),
        }

        let span = info_span!("instance", tunnel = %artifact.id(), instance = %id);
        let launched = launch(ctx, &dir, tunnel_id, &secret, &source)
            .instrument(span.clone())
            .await;
        let mut child = match launched {
            Ok(child) => child,
            Err(error) => {
                if let Err(error) = fs::remove_dir_all(&dir).await {
                    warn!(dir = %dir.display(), %error, "Failed to clean up instance directory");
                }
                return Err(error);
            }
        };

        let pid = child.id();
        let span = info_span!("cloudflared", instance = %id, pid);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(stdout, "stdout").instrument(span.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(stderr, "stderr").instrument(span.clone()));
        }

        ctx.metrics.started.inc();
        ctx.metrics.running.inc();
        info!(tunnel = %artifact.id(), instance = %id, ?pid, "Started tunnel agent");

        let kill = ctx.shutdown.child_token();
        let exited = Arc::new(AtomicBool::new(false));
        let reaper = tokio::spawn(
            reap(Reap {
                child,
                kill: kill.clone(),
                dir: dir.clone(),
                preserve: ctx.config.preserve,
                metrics: ctx.metrics.clone(),
                exited: exited.clone(),
            })
            .instrument(span),
        );

        Ok(Self {
            id,
            source,
            dir,
            pid,
            kill,
            reaper: Some(reaper),
            exited,
        })
    }

    /// Whether the process is still running under supervision.
    pub(crate) fn is_alive(&self) -> bool {
        self.reaper.is_some() && !self.exited.load(Ordering::Acquire)
    }

    /// Kills the process and waits for its cleanup. Calling this again is a
    /// no-op.
    pub(crate) async fn stop(&mut self, metrics: &SupervisorMetrics) {
        let Some(reaper) = self.reaper.take() else {
            return;
        };
        let was_running = !self.exited.load(Ordering::Acquire);
        self.kill.cancel();
        if let Err(error) = reaper.await {
            warn!(instance = %self.id, %error, "Reaper task failed");
        }
        if was_running {
            metrics.stopped.inc();
            info!(instance = %self.id, "Stopped tunnel agent");
        }
    }
}

/// Flattens the decoded rules in fragment-key order.
pub(crate) fn rules(source: &Source) -> impl Iterator<Item = &IngressRule> {
    source.values().flatten()
}

pub(crate) fn secret_name(artifact: &Artifact, default_namespace: &str) -> Result<ResourceName, Error> {
    if let Some(fqdn) = artifact.annotation(annotations::TUNNEL_K8S_SECRET) {
        return Ok(ResourceName::from_fqdn(fqdn, default_namespace));
    }
    let name = artifact
        .annotation(annotations::TUNNEL_NAME)
        .ok_or(Error::MissingAnnotation(annotations::TUNNEL_NAME))?;
    Ok(TunnelParams::new(&artifact.namespace, name).secret_name())
}

/// Writes the instance's files, routes its hostnames and spawns the agent.
async fn launch(
    ctx: &Context,
    dir: &Path,
    tunnel_id: Uuid,
    secret: &ResourceName,
    source: &Source,
) -> Result<Child, Error> {
    let credentials = ctx.credentials.fetch(secret, tunnel_id).await?;
    let credentials_path = dir.join(CREDENTIALS_FILE);
    write_private(&credentials_path, &serde_json::to_vec(&credentials)?).await?;

    let config = TunnelConfig::new(
        tunnel_id.to_string(),
        &credentials_path,
        rules(source).cloned(),
    );
    let config_path = dir.join(CONFIG_FILE);
    write_private(&config_path, config.to_yaml()?.as_bytes()).await?;

    let hostnames = rules(source)
        .filter_map(IngressRule::routed_hostname)
        .collect::<BTreeSet<_>>();
    for hostname in hostnames {
        match ctx.provider.route_tunnel(tunnel_id, hostname).await {
            Ok(()) => debug!(%hostname, "Routed hostname"),
            Err(ProviderError::AlreadyRouted { .. }) => debug!(%hostname, "Hostname already routed"),
            Err(error) => {
                return Err(Error::Route {
                    hostname: hostname.to_string(),
                    source: error,
                })
            }
        }
    }

    Command::new(&ctx.config.cloudflared)
        .args(["tunnel", "--no-autoupdate", "--config"])
        .arg(&config_path)
        .arg("run")
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::Spawn {
            path: ctx.config.cloudflared.clone(),
            source,
        })
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), Error> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await.map_err(io(path))?;
    file.write_all(contents).await.map_err(io(path))?;
    file.flush().await.map_err(io(path))
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn log_lines(output: impl AsyncRead + Unpin, stream: &'static str) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(stream, "{line}"),
            Ok(None) => return,
            Err(error) => {
                debug!(stream, %error, "Failed to read output");
                return;
            }
        }
    }
}

struct Reap {
    child: Child,
    kill: CancellationToken,
    dir: PathBuf,
    preserve: bool,
    metrics: SupervisorMetrics,
    exited: Arc<AtomicBool>,
}

async fn reap(
    Reap {
        mut child,
        kill,
        dir,
        preserve,
        metrics,
        exited,
    }: Reap,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => error!(%status, "Tunnel agent exited unexpectedly"),
                Err(error) => error!(%error, "Failed to wait on tunnel agent"),
            }
            metrics.crashed.inc();
        }
        _ = kill.cancelled() => {
            if let Err(error) = child.kill().await {
                warn!(%error, "Failed to kill tunnel agent");
            }
        }
    }
    metrics.running.dec();

    if !preserve {
        if let Err(error) = fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), %error, "Failed to remove instance directory");
        }
    }
    exited.store(true, Ordering::Release);
}
