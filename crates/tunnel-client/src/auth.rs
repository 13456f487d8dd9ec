use std::{fmt, path::Path, sync::Arc};

use russh::{
    MethodKind, MethodSet,
    client::{self, AuthResult, Handle},
    keys::{self, PrivateKeyWithHashAlg},
};
use secrecy::ExposeSecret;
use tokio::fs;
use tracing::{debug, info, warn};
use tunnel_types::{AuthOverride, TunnelConfig};

use crate::ClientError;

type Result<T> = crate::ClientResult<T>;

/// The subset of the server's advertised methods this client can use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdvertisedMethods {
    pub password: bool,
    pub public_key: bool,
}

impl AdvertisedMethods {
    pub fn from_methods(methods: &MethodSet) -> Self {
        Self {
            password: methods.iter().any(|kind| matches!(kind, MethodKind::Password)),
            public_key: methods.iter().any(|kind| matches!(kind, MethodKind::PublicKey)),
        }
    }
}

impl fmt::Display for AdvertisedMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(self.password, "password"), (self.public_key, "publickey")]
            .into_iter()
            .filter_map(|(on, name)| on.then_some(name))
            .collect();
        if names.is_empty() { f.write_str("none") } else { f.write_str(&names.join(",")) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthChoice {
    Password,
    PublicKey,
}

/// Pick one method. An override only applies when the server advertises it; otherwise password wins over public key.
pub fn choose_method(advertised: AdvertisedMethods, requested: Option<AuthOverride>) -> Result<AuthChoice> {
    match requested {
        Some(AuthOverride::Password) if advertised.password => return Ok(AuthChoice::Password),
        Some(AuthOverride::PublicKey) if advertised.public_key => return Ok(AuthChoice::PublicKey),
        Some(other) => warn!(requested = ?other, "requested authentication method not offered by the server"),
        None => {}
    }
    if advertised.password {
        Ok(AuthChoice::Password)
    } else if advertised.public_key {
        Ok(AuthChoice::PublicKey)
    } else {
        Err(ClientError::AuthFailed("no supported authentication methods found".to_string()))
    }
}

/// Query the server's methods, pick one, and authenticate with it. A single attempt, no fallback.
pub async fn authenticate<H>(session: &mut Handle<H>, config: &TunnelConfig) -> Result<()>
where
    H: client::Handler + Send,
{
    let advertised = match session.authenticate_none(config.username.clone()).await? {
        AuthResult::Success => {
            info!("server accepted the session without authentication");
            return Ok(());
        }
        AuthResult::Failure { remaining_methods, .. } => AdvertisedMethods::from_methods(&remaining_methods),
    };
    info!(methods = %advertised, "authentication methods");

    match choose_method(advertised, config.auth_override)? {
        AuthChoice::Password => {
            let result = session
                .authenticate_password(config.username.clone(), config.password.expose_secret().to_string())
                .await?;
            if !result.success() {
                return Err(ClientError::AuthFailed("authentication by password failed".to_string()));
            }
            info!("authentication by password succeeded");
        }
        AuthChoice::PublicKey => {
            let key = load_private_key(config).await?;
            let hash_alg = if key.algorithm().is_rsa() {
                session.best_supported_rsa_hash().await.unwrap_or(None).flatten()
            } else {
                None
            };
            let result = session
                .authenticate_publickey(config.username.clone(), PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await?;
            if !result.success() {
                return Err(ClientError::AuthFailed("authentication by public key failed".to_string()));
            }
            info!("authentication by public key succeeded");
        }
    }
    Ok(())
}

/// The login password doubles as the key passphrase when it is non-empty.
async fn load_private_key(config: &TunnelConfig) -> Result<keys::PrivateKey> {
    let public = config.keys.public_key.as_path();
    if !exists(public).await {
        warn!(path = %public.display(), "public key file not found; deriving it from the private key");
    }
    let path = config.keys.private_key.as_path();
    let data = fs::read_to_string(path)
        .await
        .map_err(|err| ClientError::AuthFailed(format!("cannot read private key {}: {err}", path.display())))?;
    let password = config.password.expose_secret();
    let passphrase = (!password.is_empty()).then_some(password);
    debug!(path = %path.display(), encrypted = passphrase.is_some(), "loading private key");
    keys::decode_secret_key(&data, passphrase).map_err(|err| ClientError::Crypto(format!("failed to load {}: {err}", path.display())))
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
