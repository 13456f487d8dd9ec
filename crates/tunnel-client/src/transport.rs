use std::{borrow::Cow, sync::Arc, time::Duration};

use russh::{
    Preferred,
    client::Config,
    keys::{Algorithm, HashAlg},
};
use tunnel_types::TunnelConfig;

const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// Algorithm preferences: russh defaults, or an older suite for legacy servers.
pub fn preferred(insecure: bool) -> Preferred {
    if !insecure {
        return Preferred::DEFAULT.clone();
    }
    Preferred {
        kex: Cow::Owned(vec![russh::kex::CURVE25519, russh::kex::DH_G14_SHA1, russh::kex::DH_G1_SHA1]),
        key: Cow::Owned(vec![
            Algorithm::Ed25519,
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
            Algorithm::Rsa { hash: None },
        ]),
        cipher: Cow::Owned(vec![
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_128_CTR,
            russh::cipher::AES_128_CBC,
            russh::cipher::TRIPLE_DES_CBC,
        ]),
        mac: Cow::Owned(vec![russh::mac::HMAC_SHA256, russh::mac::HMAC_SHA512, russh::mac::HMAC_SHA1]),
        compression: Preferred::DEFAULT.compression,
    }
}

pub(crate) fn client_config(config: &TunnelConfig) -> Arc<Config> {
    Arc::new(Config {
        preferred: preferred(config.insecure),
        nodelay: true,
        inactivity_timeout: None,
        keepalive_interval: config.keepalive_interval.or(Some(DEFAULT_KEEPALIVE)),
        keepalive_max: 3,
        ..Default::default()
    })
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
