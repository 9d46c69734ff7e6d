//! RSA key format: per-user seeds sealed under a certificate's public key.
//!
//! The stored row carries the OAEP-sealed seed plus an exportable encrypted
//! certificate bundle. The bundle passphrase comes from the configured
//! [`PassphraseMode`]; deriving it from the UPN is a legacy compatibility
//! mode only, since that passphrase is computable from public identity data.
//! Rotating a certificate never re-seals previously stored seeds: a seed
//! stays bound to the bundle it was written with.

use anyhow::anyhow;
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use rsa::{
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use totp_rs::Secret;
use tracing::info;
use uuid::Uuid;

use crate::config::{KeyFormat, MfaConfig, PassphraseMode};
use crate::error::MfaError;
use crate::keys::store::{KeyRecord, KeyStore};
use crate::keys::SecretKeyManager;
use crate::repo::bounded;
use crate::validate::normalize_upn;

const RSA_BITS: usize = 2048;
const NONCE_LEN: usize = 12;

/// Exportable per-user certificate: public half in the clear, private half
/// sealed under the passphrase-derived key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserCertificate {
    pub serial: Uuid,
    pub public_key_der: Vec<u8>,
    encrypted_private_key: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl UserCertificate {
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now <= self.not_after
    }
}

#[derive(Clone)]
pub struct RsaKeyManager {
    key_size: usize,
    validity_years: u32,
    passphrase_mode: PassphraseMode,
    timeout: Duration,
    store: Arc<dyn KeyStore>,
}

impl RsaKeyManager {
    #[must_use]
    pub fn new(config: &MfaConfig, store: Arc<dyn KeyStore>) -> Self {
        Self {
            key_size: config.key_size(),
            validity_years: config.certificate_validity_years(),
            passphrase_mode: config.passphrase_mode().clone(),
            timeout: config.repository_timeout(),
            store,
        }
    }

    /// Generate a fresh certificate for the identity. The caller decides
    /// whether and when to persist it; `new_key` does so automatically when
    /// no usable certificate is on record.
    pub fn create_certificate(
        &self,
        upn: &str,
        validity_years: u32,
    ) -> Result<UserCertificate, MfaError> {
        let upn = normalize_upn(upn);
        let private_key =
            RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|err| MfaError::Crypto(anyhow!(err)))?;
        let serial = Uuid::new_v4();
        let not_before = Utc::now();
        let not_after = not_before + chrono::Duration::days(i64::from(validity_years) * 365);

        let pkcs8 = private_key
            .to_pkcs8_der()
            .map_err(|err| MfaError::Crypto(anyhow!(err)))?;
        let encrypted_private_key = seal(
            &self.passphrase_key(&upn),
            pkcs8.as_bytes(),
            &bundle_aad(&upn, serial),
        )?;
        let public_key_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|err| MfaError::Crypto(anyhow!(err)))?
            .into_vec();

        info!(upn = %upn, serial = %serial, "created user certificate");
        Ok(UserCertificate {
            serial,
            public_key_der,
            encrypted_private_key,
            not_before,
            not_after,
        })
    }

    /// Certificate currently on record for the identity, if any.
    pub async fn get_user_certificate(
        &self,
        upn: &str,
    ) -> Result<Option<UserCertificate>, MfaError> {
        let upn = normalize_upn(upn);
        let record = bounded(self.timeout, self.store.fetch(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0314", err))?;
        record
            .and_then(|record| record.certificate)
            .map(|bundle| decode_bundle(&bundle))
            .transpose()
    }

    fn passphrase_key(&self, upn: &str) -> Key {
        let mut hasher = Sha256::new();
        match &self.passphrase_mode {
            PassphraseMode::DerivedFromUpn => {
                hasher.update(b"cert-passphrase:");
                hasher.update(normalize_upn(upn).as_bytes());
            }
            PassphraseMode::StoredKek(kek) => {
                hasher.update(b"cert-kek:");
                hasher.update(kek.expose_secret().as_bytes());
            }
        }
        let digest: [u8; 32] = hasher.finalize().into();
        Key::from(digest)
    }

    fn unseal_private_key(
        &self,
        upn: &str,
        certificate: &UserCertificate,
    ) -> Result<RsaPrivateKey, MfaError> {
        let pkcs8 = open(
            &self.passphrase_key(upn),
            &certificate.encrypted_private_key,
            &bundle_aad(upn, certificate.serial),
        )?;
        RsaPrivateKey::from_pkcs8_der(&pkcs8).map_err(|_| MfaError::MalformedKey)
    }
}

#[async_trait]
impl SecretKeyManager for RsaKeyManager {
    async fn new_key(&self, upn: &str) -> Result<SecretString, MfaError> {
        let upn = normalize_upn(upn);
        let existing = bounded(self.timeout, self.store.fetch(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0311", err))?;

        let certificate = match existing
            .and_then(|record| record.certificate)
            .map(|bundle| decode_bundle(&bundle))
            .transpose()?
        {
            Some(certificate) if certificate.is_valid_at(Utc::now()) => certificate,
            _ => self.create_certificate(&upn, self.validity_years)?,
        };

        let public_key = RsaPublicKey::from_public_key_der(&certificate.public_key_der)
            .map_err(|_| MfaError::MalformedKey)?;

        let mut seed_bytes = vec![0u8; self.key_size];
        OsRng.fill_bytes(&mut seed_bytes);
        let sealed = public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &seed_bytes)
            .map_err(|err| MfaError::Crypto(anyhow!(err)))?;

        let record = KeyRecord {
            upn: upn.clone(),
            format: KeyFormat::Rsa,
            seed: Base64::encode_string(&sealed),
            certificate: Some(encode_bundle(&certificate)?),
            creation_date: Utc::now(),
        };
        bounded(self.timeout, self.store.upsert(record))
            .await
            .map_err(|err| MfaError::repository("MFA0312", err))?;
        info!(upn = %upn, "issued new rsa-sealed secret key");

        Ok(SecretString::from(Secret::Raw(seed_bytes).to_encoded().to_string()))
    }

    async fn get_user_key(&self, upn: &str) -> Result<Option<SecretString>, MfaError> {
        let upn = normalize_upn(upn);
        let Some(record) = bounded(self.timeout, self.store.fetch(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0313", err))?
        else {
            return Ok(None);
        };

        match record.format {
            // Rows written by other formats stay readable as-is.
            KeyFormat::Rng | KeyFormat::Custom => Ok(Some(SecretString::from(record.seed))),
            KeyFormat::Rsa => {
                let bundle = record.certificate.ok_or(MfaError::MissingCertificate)?;
                let certificate = decode_bundle(&bundle)?;
                let private_key = self.unseal_private_key(&upn, &certificate)?;
                let sealed =
                    Base64::decode_vec(&record.seed).map_err(|_| MfaError::MalformedKey)?;
                let seed_bytes = private_key
                    .decrypt(Oaep::new::<Sha256>(), &sealed)
                    .map_err(|_| MfaError::MalformedKey)?;
                Ok(Some(SecretString::from(
                    Secret::Raw(seed_bytes).to_encoded().to_string(),
                )))
            }
        }
    }

    async fn has_stored_key(&self, upn: &str) -> Result<bool, MfaError> {
        let upn = normalize_upn(upn);
        let record = bounded(self.timeout, self.store.fetch(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0315", err))?;
        Ok(record.is_some())
    }

    async fn remove_user_key(&self, upn: &str) -> Result<bool, MfaError> {
        let upn = normalize_upn(upn);
        let removed = bounded(self.timeout, self.store.delete(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0316", err))?;
        if removed {
            info!(upn = %upn, "removed rsa-sealed secret key");
        }
        Ok(removed)
    }
}

fn bundle_aad(upn: &str, serial: Uuid) -> Vec<u8> {
    // AAD = "mfa-cert:v1|upn|serial"
    format!("mfa-cert:v1|{upn}|{serial}").into_bytes()
}

fn seal(key: &Key, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, MfaError> {
    let cipher = ChaCha20Poly1305::new(key);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|err| MfaError::Crypto(anyhow!("bundle seal failure: {err}")))?;
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open(key: &Key, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, MfaError> {
    if sealed.len() < NONCE_LEN {
        return Err(MfaError::MalformedKey);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key);
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| MfaError::MalformedKey)
}

fn encode_bundle(certificate: &UserCertificate) -> Result<String, MfaError> {
    let json = serde_json::to_vec(certificate)
        .map_err(|err| MfaError::Crypto(anyhow!("bundle encode failure: {err}")))?;
    Ok(Base64::encode_string(&json))
}

fn decode_bundle(bundle: &str) -> Result<UserCertificate, MfaError> {
    let json = Base64::decode_vec(bundle).map_err(|_| MfaError::MalformedKey)?;
    serde_json::from_slice(&json).map_err(|_| MfaError::MalformedKey)
}
