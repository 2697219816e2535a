use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use sha2::Sha256;

use crate::core::{AlertEvent, Chain, Direction, ScoreBreakdown};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Whalecli-Signature";
pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize)]
pub struct RuleRef {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: &'static str,
    pub value: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletRef {
    pub address: String,
    pub chain: Chain,
    pub label: String,
}

/// Body POSTed to the alert webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub schema_version: &'static str,
    pub event_type: &'static str,
    pub triggered_at: DateTime<Utc>,
    pub rule: RuleRef,
    pub wallet: WalletRef,
    pub score: u8,
    pub score_breakdown: ScoreBreakdown,
    pub direction: Direction,
    pub net_flow_usd: f64,
    pub alert_id: i64,
}

impl WebhookPayload {
    pub fn from_alert(alert: &AlertEvent, score_threshold: u8) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_type: "whale_alert",
            triggered_at: alert.triggered_at,
            rule: RuleRef {
                id: alert.rule_id.clone(),
                rule_type: "score",
                value: score_threshold,
            },
            wallet: WalletRef {
                address: alert.address.clone(),
                chain: alert.chain,
                label: alert.label.clone(),
            },
            score: alert.score,
            score_breakdown: alert.score_breakdown.unwrap_or_default(),
            direction: alert.direction,
            net_flow_usd: alert.net_flow_usd,
            alert_id: alert.id,
        }
    }
}

/// `sha256=<hex>` HMAC of the raw body.
pub fn sign(body: &[u8], secret: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// One delivery attempt. Returns the HTTP status of any response, or
/// `None` on timeout or transport failure.
pub async fn dispatch_webhook(
    client: &reqwest::Client,
    url: &str,
    secret: Option<&str>,
    payload: &WebhookPayload,
    timeout: Duration,
) -> Option<u16> {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Failed to serialize webhook payload: {e}");
            return None;
        }
    };

    let mut request = client
        .post(url)
        .timeout(timeout)
        .header(CONTENT_TYPE, "application/json");
    if let Some(signature) = secret.and_then(|s| sign(&body, s)) {
        request = request.header(SIGNATURE_HEADER, signature);
    }

    match request.body(body).send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                tracing::debug!(alert_id = payload.alert_id, status, "webhook delivered");
            } else {
                tracing::warn!(alert_id = payload.alert_id, status, "webhook rejected");
            }
            Some(status)
        }
        Err(e) => {
            tracing::warn!(alert_id = payload.alert_id, "webhook delivery failed: {e}");
            None
        }
    }
}
