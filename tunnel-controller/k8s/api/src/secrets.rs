use crate::{ObjectMeta, Secret};
use cloudflared_tunnel_controller_core::{
    annotations,
    credentials::{CredentialError, CredentialStore, Credentials},
    ResourceName, TunnelParams, Uuid,
};
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, PostParams},
    Client,
};
use std::collections::BTreeMap;

/// The Secret data key holding the agent's `credentials.json`.
pub const CREDENTIALS_KEY: &str = "credentials.json";

/// A [`CredentialStore`] backed by Kubernetes Secrets.
#[derive(Clone)]
pub struct SecretCredentials {
    client: Client,
    account_tag: String,
    cluster: String,
    labels: BTreeMap<String, String>,
}

// === impl SecretCredentials ===

impl SecretCredentials {
    pub fn new(
        client: Client,
        account_tag: String,
        cluster: String,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            client,
            account_tag,
            cluster,
            labels,
        }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl CredentialStore for SecretCredentials {
    async fn fetch(
        &self,
        secret: &ResourceName,
        tunnel_id: Uuid,
    ) -> Result<Credentials, CredentialError> {
        let obj = self
            .api(&secret.namespace)
            .get_opt(&secret.name)
            .await
            .map_err(anyhow::Error::from)?
            .ok_or_else(|| CredentialError::NotFound(secret.clone()))?;
        credentials_from_secret(&obj, secret, tunnel_id, &self.account_tag)
    }

    async fn create(
        &self,
        tunnel: &TunnelParams,
        credentials: Credentials,
    ) -> Result<Credentials, CredentialError> {
        let name = tunnel.secret_name();
        let json = serde_json::to_vec(&credentials).map_err(anyhow::Error::from)?;
        let annotations = BTreeMap::from([
            (
                annotations::TUNNEL_ID.to_string(),
                credentials.tunnel_id.to_string(),
            ),
            (
                annotations::TUNNEL_CFD_NAME.to_string(),
                tunnel.display_name(&self.cluster),
            ),
            (
                annotations::TUNNEL_K8S_CONFIGMAP.to_string(),
                tunnel.config_map_name().to_string(),
            ),
        ]);
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.name.clone()),
                namespace: Some(name.namespace.clone()),
                annotations: Some(annotations),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CREDENTIALS_KEY.to_string(),
                ByteString(json),
            )])),
            ..Default::default()
        };

        let api = self.api(&name.namespace);
        let params = PostParams::default();
        match api.get_opt(&name.name).await.map_err(anyhow::Error::from)? {
            None => {
                api.create(&params, &secret)
                    .await
                    .map_err(anyhow::Error::from)?;
                tracing::info!(secret = %name, tunnel = %credentials.tunnel_id, "Created credentials");
            }
            Some(existing) => {
                secret.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name.name, &params, &secret)
                    .await
                    .map_err(anyhow::Error::from)?;
                tracing::info!(secret = %name, tunnel = %credentials.tunnel_id, "Updated credentials");
            }
        }
        Ok(credentials)
    }

    async fn delete(&self, tunnel: &TunnelParams) -> Result<(), CredentialError> {
        let name = tunnel.secret_name();
        match self
            .api(&name.namespace)
            .delete(&name.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(rsp)) if rsp.code == 404 => {
                tracing::debug!(secret = %name, "Credentials already deleted");
                Ok(())
            }
            Err(error) => Err(anyhow::Error::from(error).into()),
        }
    }
}

/// Extracts and verifies the credentials held in a Secret.
pub fn credentials_from_secret(
    secret: &Secret,
    name: &ResourceName,
    tunnel_id: Uuid,
    account_tag: &str,
) -> Result<Credentials, CredentialError> {
    let json = secret
        .data
        .as_ref()
        .and_then(|data| data.get(CREDENTIALS_KEY))
        .ok_or_else(|| CredentialError::Malformed {
            secret: name.clone(),
            reason: format!("missing {CREDENTIALS_KEY}"),
        })?;
    let credentials = serde_json::from_slice::<Credentials>(&json.0).map_err(|error| {
        CredentialError::Malformed {
            secret: name.clone(),
            reason: error.to_string(),
        }
    })?;

    if credentials.tunnel_id != tunnel_id {
        return Err(CredentialError::Mismatch {
            secret: name.clone(),
            expected: tunnel_id,
            reason: format!("holds tunnel {}", credentials.tunnel_id),
        });
    }
    if credentials.account_tag != account_tag {
        return Err(CredentialError::Mismatch {
            secret: name.clone(),
            expected: tunnel_id,
            reason: "account tag differs".to_string(),
        });
    }
    Ok(credentials)
}
