use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hkdf::Hkdf;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::Sha256;

use super::{status_detail, transport_failure, ChannelAdapter, Outcome};
use crate::config::Config;
use crate::db::models::{Channel, Priority};
use crate::services::request::{Content, Destination, PushKeys};

/// VAPID tokens may live at most 24h; we sign for 12h.
const VAPID_TOKEN_LIFETIME_SECONDS: i64 = 12 * 60 * 60;

const SALT_LEN: usize = 16;
const PUBLIC_KEY_LEN: usize = 65;
const AUTH_SECRET_LEN: usize = 16;
const RECORD_SIZE: u32 = 4096;
/// Push services accept 4096 bytes; keep clear of header, padding and tag.
const MAX_PAYLOAD_BYTES: usize = 3500;

const IKM_INFO_PREFIX: &[u8] = b"WebPush: info\0";
const KEY_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";

/// Web Push delivery authenticated with VAPID.
///
/// The title, body and record id travel as a JSON payload encrypted for the
/// subscription (`aes128gcm`).
#[derive(Clone)]
pub struct PushAdapter {
    provider: Option<WebPush>,
}

#[derive(Clone)]
struct WebPush {
    client: reqwest::Client,
    signing_key: EncodingKey,
    public_key: String,
    subject: String,
    ttl_seconds: u32,
}

#[derive(Debug, Serialize)]
struct VapidClaims<'a> {
    aud: &'a str,
    exp: i64,
    sub: &'a str,
}

impl PushAdapter {
    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        if !config.push_enabled() {
            return Self::disabled();
        }
        let push = &config.push;
        let (Some(email), Some(public_key), Some(pem)) = (
            push.vapid_email.as_deref(),
            push.vapid_public_key.as_deref(),
            push.vapid_private_key_pem.as_deref(),
        ) else {
            return Self::disabled();
        };

        // Keys passed through env files often carry escaped newlines.
        let pem = pem.replace("\\n", "\n");
        let signing_key = match EncodingKey::from_ec_pem(pem.as_bytes()) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Invalid VAPID private key, push channel disabled: {}", e);
                return Self::disabled();
            }
        };

        let subject = if email.starts_with("mailto:") {
            email.to_string()
        } else {
            format!("mailto:{}", email)
        };

        Self {
            provider: Some(WebPush {
                client,
                signing_key,
                public_key: public_key.to_string(),
                subject,
                ttl_seconds: push.ttl_seconds,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }
}

impl WebPush {
    fn vapid_authorization(&self, audience: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = VapidClaims {
            aud: audience,
            exp: Utc::now().timestamp() + VAPID_TOKEN_LIFETIME_SECONDS,
            sub: &self.subject,
        };
        let token = encode(&Header::new(Algorithm::ES256), &claims, &self.signing_key)?;
        Ok(format!("vapid t={}, k={}", token, self.public_key))
    }
}

#[derive(Debug, thiserror::Error)]
enum PayloadError {
    #[error("invalid subscription key: {0}")]
    InvalidKey(&'static str),
    #[error("failed to serialize push payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("push payload encryption failed")]
    Cipher,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushPayload {
    title: String,
    body: String,
    record_id: String,
    priority: Priority,
}

impl PushPayload {
    fn from_content(content: &Content) -> Self {
        Self {
            title: truncate(&content.title, 120),
            body: truncate(&content.body, 600),
            record_id: content.record_id.clone(),
            priority: content.priority,
        }
    }

    fn into_bytes(mut self) -> Result<Vec<u8>, PayloadError> {
        let bytes = serde_json::to_vec(&self)?;
        if bytes.len() <= MAX_PAYLOAD_BYTES {
            return Ok(bytes);
        }
        self.title = truncate(&self.title, 80);
        self.body = "Open the app to view details.".to_string();
        Ok(serde_json::to_vec(&self)?)
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    let mut chars = input.chars();
    let mut out: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        out.push('…');
    }
    out
}

fn decode_key<const N: usize>(value: &str, name: &'static str) -> Result<[u8; N], PayloadError> {
    URL_SAFE_NO_PAD
        .decode(value.trim().trim_end_matches('='))
        .ok()
        .and_then(|raw| <[u8; N]>::try_from(raw).ok())
        .ok_or(PayloadError::InvalidKey(name))
}

fn hkdf_sha256<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N], PayloadError> {
    let mut okm = [0u8; N];
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, &mut okm)
        .map_err(|_| PayloadError::Cipher)?;
    Ok(okm)
}

/// Encrypt `plaintext` for a subscription as a single `aes128gcm` record
/// (RFC 8291). Returns the full request body, header included.
fn encrypt_payload(plaintext: &[u8], keys: &PushKeys) -> Result<Vec<u8>, PayloadError> {
    let ua_public_raw: [u8; PUBLIC_KEY_LEN] = decode_key(&keys.p256dh, "p256dh")?;
    let auth_secret: [u8; AUTH_SECRET_LEN] = decode_key(&keys.auth, "auth")?;
    let ua_public = p256::PublicKey::from_sec1_bytes(&ua_public_raw)
        .map_err(|_| PayloadError::InvalidKey("p256dh"))?;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let as_secret = EphemeralSecret::random(&mut OsRng);
    let as_public = as_secret.public_key().to_encoded_point(false);
    let as_public_raw: [u8; PUBLIC_KEY_LEN] = as_public
        .as_bytes()
        .try_into()
        .map_err(|_| PayloadError::Cipher)?;
    let shared = as_secret.diffie_hellman(&ua_public);

    let mut key_info = Vec::with_capacity(IKM_INFO_PREFIX.len() + 2 * PUBLIC_KEY_LEN);
    key_info.extend_from_slice(IKM_INFO_PREFIX);
    key_info.extend_from_slice(&ua_public_raw);
    key_info.extend_from_slice(&as_public_raw);

    let ikm: [u8; 32] = hkdf_sha256(&auth_secret, shared.raw_secret_bytes().as_slice(), &key_info)?;
    let cek: [u8; 16] = hkdf_sha256(&salt, &ikm, KEY_INFO)?;
    let nonce: [u8; 12] = hkdf_sha256(&salt, &ikm, NONCE_INFO)?;

    // 0x02 marks the last (and only) record.
    let mut padded = Vec::with_capacity(plaintext.len() + 1);
    padded.extend_from_slice(plaintext);
    padded.push(2);

    let cipher = Aes128Gcm::new_from_slice(&cek).map_err(|_| PayloadError::Cipher)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), padded.as_slice())
        .map_err(|_| PayloadError::Cipher)?;

    let mut body = Vec::with_capacity(SALT_LEN + 5 + PUBLIC_KEY_LEN + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(PUBLIC_KEY_LEN as u8);
    body.extend_from_slice(&as_public_raw);
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

/// The push service origin, which is the VAPID audience.
fn audience(endpoint: &str) -> Option<String> {
    let url = url::Url::parse(endpoint).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

fn urgency(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "normal",
        Priority::High => "high",
    }
}

/// Map a push service response onto an outcome.
///
/// 404 and 410 mean the subscription no longer exists and must be dropped.
/// 400 and 413 are hard rejections of the request itself.
fn classify(status: StatusCode, body: &str) -> Outcome {
    match status {
        s if s.is_success() => Outcome::success(),
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Outcome::subscription_expired(format!("push subscription expired ({})", status.as_u16()))
        }
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
            Outcome::permanent(status_detail("Push service", status, body))
        }
        _ => Outcome::transient(status_detail("Push service", status, body)),
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    async fn send(&self, destination: &Destination, content: &Content) -> Outcome {
        let Some(provider) = &self.provider else {
            tracing::warn!("Push channel is disabled; skipping send for {}", content.record_id);
            return Outcome::disabled();
        };

        let Destination::Push { subscription } = destination else {
            return Outcome::permanent("push adapter received a non-push destination");
        };

        let Some(aud) = audience(&subscription.endpoint) else {
            return Outcome::permanent("push endpoint has no origin");
        };

        let authorization = match provider.vapid_authorization(&aud) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Failed to sign VAPID token: {}", e);
                return Outcome::permanent("failed to sign VAPID token");
            }
        };

        let body = match PushPayload::from_content(content)
            .into_bytes()
            .and_then(|payload| encrypt_payload(&payload, &subscription.keys))
        {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Cannot encrypt push for record {}: {}", content.record_id, e);
                return Outcome::permanent(e.to_string());
            }
        };

        let response = match provider
            .client
            .post(&subscription.endpoint)
            .header("Authorization", authorization)
            .header("TTL", provider.ttl_seconds.to_string())
            .header("Urgency", urgency(content.priority))
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return transport_failure("Push service", &e),
        };

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        let outcome = classify(status, &body);
        if outcome.succeeded {
            tracing::info!("Push delivered for record {}", content.record_id);
        } else if outcome.discard_subscription {
            tracing::info!(
                "Push subscription for record {} expired ({})",
                content.record_id,
                status.as_u16()
            );
        }
        outcome
    }
}
