use crate::k8s::{self, ObjectMeta};
use anyhow::Result;
use cloudflared_tunnel_controller_core::CONTROLLER_NAME;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::PatchParams;
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info};

pub(crate) type Claims = watch::Receiver<Arc<kubert::lease::Claim>>;

#[derive(Clone, Debug)]
pub(crate) struct LeaseParams {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: time::Duration,
    pub renew_grace_period: time::Duration,
}

pub(crate) async fn init<T>(runtime: &kubert::Runtime<T>, params: &LeaseParams) -> Result<Claims> {
    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // A resource version of "0" only creates the Lease when it is
            // missing.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    CONTROLLER_NAME.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), &params.namespace);
    match api
        .patch(
            &params.name,
            &PatchParams {
                field_manager: Some(CONTROLLER_NAME.to_string()),
                ..Default::default()
            },
            &kube::api::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let claim = kubert::lease::ClaimParams {
        lease_duration: params.lease_duration,
        renew_grace_period: params.renew_grace_period,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, &params.name)
        .await?
        .spawn(&params.identity, claim)
        .await?;
    Ok(claims)
}

/// Waits until `identity` holds the lease.
pub(crate) async fn acquired(claims: &mut Claims, identity: &str) -> Result<()> {
    loop {
        if claims.borrow_and_update().is_current_for(identity) {
            return Ok(());
        }
        debug!(holder = %claims.borrow().holder, "Waiting for leadership");
        claims.changed().await?;
    }
}

/// Completes once `identity` no longer holds the lease.
pub(crate) async fn lost(claims: &mut Claims, identity: &str) {
    while claims.changed().await.is_ok() {
        if !claims.borrow_and_update().is_current_for(identity) {
            return;
        }
    }
}
