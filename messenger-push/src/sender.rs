use async_trait::async_trait;
use messenger_core::events::UserId;
use std::time::Duration;
use web_push::{
    ContentEncoding, SubscriptionInfo, Urgency, VapidSignatureBuilder, WebPushMessageBuilder,
};

use crate::error::{classify_status, PushError};

pub const PUSH_TTL_SECS: u32 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushUrgency {
    Normal,
    High,
}

impl PushUrgency {
    fn to_provider(self) -> Urgency {
        match self {
            PushUrgency::Normal => Urgency::Normal,
            PushUrgency::High => Urgency::High,
        }
    }
}

/// Everything needed for one delivery attempt to one device. Built fresh
/// per queue message, never persisted.
#[derive(Debug, Clone)]
pub struct PreparedPushNotification {
    pub recipient_user_id: UserId,
    pub device_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    /// Serialized `PushNotificationContent`, encrypted on the way out.
    pub payload: Vec<u8>,
    pub ttl: u32,
    pub urgency: PushUrgency,
    pub topic: Option<String>,
}

/// Performs exactly one Web Push delivery attempt; retry lives in the
/// listener, not here.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, notification: &PreparedPushNotification) -> Result<(), PushError>;
}

pub struct WebPushSender {
    client: reqwest::Client,
    vapid_private_key: String,
    vapid_subject: String,
}

impl WebPushSender {
    pub fn new(
        vapid_private_key: String,
        vapid_subject: String,
        request_timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            vapid_private_key,
            vapid_subject,
        })
    }
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn send(&self, notification: &PreparedPushNotification) -> Result<(), PushError> {
        let sub_info = SubscriptionInfo::new(
            &notification.endpoint,
            &notification.p256dh,
            &notification.auth,
        );

        let mut sig_builder =
            VapidSignatureBuilder::from_base64(&self.vapid_private_key, &sub_info)
                .map_err(|e| PushError::Unexpected(format!("VAPID signature: {}", e)))?;
        sig_builder.add_claim("sub", self.vapid_subject.as_str());
        let signature = sig_builder
            .build()
            .map_err(|e| PushError::Unexpected(format!("VAPID JWT: {}", e)))?;

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, &notification.payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(notification.ttl);
        builder.set_urgency(notification.urgency.to_provider());
        if let Some(topic) = &notification.topic {
            builder.set_topic(topic.clone());
        }
        let message = builder
            .build()
            .map_err(|e| PushError::Unexpected(format!("Message build: {}", e)))?;

        // The web-push crate only encrypts and signs here; the HTTP request
        // itself goes through our own client so the timeout is enforced.
        let mut request = self
            .client
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());
        if let Some(urgency) = message.urgency {
            request = request.header("Urgency", urgency.to_string());
        }
        if let Some(topic) = message.topic {
            request = request.header("Topic", topic);
        }
        if let Some(push_payload) = message.payload {
            request = request
                .header("Content-Encoding", push_payload.content_encoding.to_str())
                .header("Content-Type", "application/octet-stream");
            for (key, value) in &push_payload.crypto_headers {
                request = request.header(*key, value.as_str());
            }
            request = request.body(push_payload.content);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PushError::TryAgainLater
            } else {
                PushError::Unexpected(format!("HTTP request: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}
