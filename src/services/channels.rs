use crate::error::{Error, Result};
use crate::models::agent::ToolUsage;
use crate::models::events::{AiResponseMessage, BusinessEvent};
use async_trait::async_trait;
use chrono::Utc;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Inbound/outbound channels the runtime serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Ws,
    WsTest,
    Instagram,
    WhatsappBusinessAccount,
    Whatsapp,
}

impl Channel {
    pub fn is_websocket(&self) -> bool {
        matches!(self, Channel::Ws | Channel::WsTest)
    }
}

/// Addressing context for one outbound send.
#[derive(Debug, Clone)]
pub struct SendContext {
    pub channel: Channel,
    pub business_id: Uuid,
    pub agent_id: Uuid,
    pub customer_id: String,
    pub thread_id: Option<String>,
    pub project_id: Option<String>,
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
}

/// One normalized message block ready for a channel.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    /// Stable id persisted with the history row; channel adapters echo it
    /// back as `reply_to_message_id` when the customer quotes this message.
    pub message_id: Option<String>,
    pub text: String,
    pub image_url: Option<String>,
    pub tools: Vec<ToolUsage>,
}

/// Outbound channel seam. The dispatcher owns retries; implementations do a
/// single attempt.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, ctx: &SendContext, message: &OutboundMessage) -> Result<()>;

    /// Publishes an event on the business's WebSocket channel (read receipts,
    /// assistant copies). Non-WebSocket implementations may no-op.
    async fn publish_business_event(&self, business_id: Uuid, event: BusinessEvent) -> Result<()>;
}

/// In-process WebSocket hub: persistent broadcast buses per topic, surviving
/// individual connection churn.
pub struct WsHub {
    buses: scc::HashMap<String, broadcast::Sender<serde_json::Value>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            buses: scc::HashMap::new(),
        }
    }

    fn topic_agent(agent_id: Uuid) -> String {
        format!("agent:{}", agent_id)
    }

    fn topic_business(business_id: Uuid) -> String {
        format!("business:{}", business_id)
    }

    async fn bus(&self, topic: String) -> broadcast::Sender<serde_json::Value> {
        if let Some(bus) = self.buses.read_async(&topic, |_, b| b.clone()).await {
            bus
        } else {
            let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
            let _ = self.buses.insert_async(topic, tx.clone()).await;
            tx
        }
    }

    /// Subscribes a WebSocket connection to an agent's event stream.
    pub async fn subscribe_agent(&self, agent_id: Uuid) -> broadcast::Receiver<serde_json::Value> {
        self.bus(Self::topic_agent(agent_id)).await.subscribe()
    }

    /// Subscribes a business dashboard connection.
    pub async fn subscribe_business(&self, business_id: Uuid) -> broadcast::Receiver<serde_json::Value> {
        self.bus(Self::topic_business(business_id)).await.subscribe()
    }

    pub async fn publish_agent(&self, agent_id: Uuid, payload: serde_json::Value) -> Result<()> {
        let bus = self.bus(Self::topic_agent(agent_id)).await;
        if bus.send(payload).is_err() {
            tracing::debug!(agent_id = %agent_id, "no websocket receivers for agent event");
        }
        Ok(())
    }

    pub async fn publish_business(&self, business_id: Uuid, payload: serde_json::Value) -> Result<()> {
        let bus = self.bus(Self::topic_business(business_id)).await;
        if bus.send(payload).is_err() {
            tracing::debug!(business_id = %business_id, "no websocket receivers for business event");
        }
        Ok(())
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes sends to the concrete channel collaborator: the in-process
/// WebSocket hub, or the thin Instagram / WhatsApp HTTP primitives.
pub struct ChannelRouter {
    hub: std::sync::Arc<WsHub>,
    http: reqwest::Client,
    graph_api_base: String,
    whatsapp_gateway_base: String,
}

impl ChannelRouter {
    pub fn new(hub: std::sync::Arc<WsHub>) -> Self {
        Self {
            hub,
            http: reqwest::Client::new(),
            graph_api_base: "https://graph.facebook.com/v19.0".to_string(),
            whatsapp_gateway_base: "http://localhost:8091".to_string(),
        }
    }

    async fn send_ws(&self, ctx: &SendContext, message: &OutboundMessage) -> Result<()> {
        let event = BusinessEvent::AiResponse {
            project_id: ctx.project_id.clone(),
            thread_id: ctx.thread_id.clone(),
            message: AiResponseMessage {
                message_id: message.message_id.clone(),
                text_response: message.text.clone(),
                attachments: message.image_url.iter().cloned().collect(),
                tools: message.tools.clone(),
            },
            created_at: Utc::now(),
        };
        self.hub
            .publish_agent(ctx.agent_id, serde_json::to_value(&event)?)
            .await
    }

    async fn send_instagram(&self, ctx: &SendContext, message: &OutboundMessage) -> Result<()> {
        let token = ctx
            .access_token
            .as_deref()
            .ok_or_else(|| Error::ChannelSend("instagram send requires an access token".into()))?;

        let mut payloads = Vec::new();
        if !message.text.is_empty() {
            payloads.push(serde_json::json!({ "text": message.text }));
        }
        if let Some(url) = &message.image_url {
            payloads.push(serde_json::json!({
                "attachment": { "type": "image", "payload": { "url": url } }
            }));
        }

        for body in payloads {
            let response = self
                .http
                .post(format!("{}/me/messages", self.graph_api_base))
                .query(&[("access_token", token)])
                .json(&serde_json::json!({
                    "recipient": { "id": ctx.customer_id },
                    "message": body,
                }))
                .send()
                .await
                .map_err(|e| Error::ChannelSend(format!("instagram send failed: {}", e)))?;
            if !response.status().is_success() {
                return Err(Error::ChannelSend(format!(
                    "instagram send returned {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }

    async fn send_waba(&self, ctx: &SendContext, message: &OutboundMessage) -> Result<()> {
        let token = ctx
            .access_token
            .as_deref()
            .ok_or_else(|| Error::ChannelSend("whatsapp business send requires an access token".into()))?;
        let phone_number_id = ctx
            .phone_number_id
            .as_deref()
            .ok_or_else(|| Error::ChannelSend("whatsapp business send requires phone_number_id".into()))?;

        let body = match &message.image_url {
            Some(url) => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": ctx.customer_id,
                "type": "image",
                "image": { "link": url, "caption": message.text },
            }),
            None => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": ctx.customer_id,
                "type": "text",
                "text": { "body": message.text },
            }),
        };

        let response = self
            .http
            .post(format!("{}/{}/messages", self.graph_api_base, phone_number_id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ChannelSend(format!("whatsapp business send failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::ChannelSend(format!(
                "whatsapp business send returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_whatsapp(&self, ctx: &SendContext, message: &OutboundMessage) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/send", self.whatsapp_gateway_base))
            .json(&serde_json::json!({
                "user_id": ctx.business_id.to_string(),
                "number": ctx.customer_id,
                "message": message.text,
                "image_url": message.image_url,
            }))
            .send()
            .await
            .map_err(|e| Error::ChannelSend(format!("whatsapp send failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::ChannelSend(format!(
                "whatsapp send returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelSender for ChannelRouter {
    async fn send(&self, ctx: &SendContext, message: &OutboundMessage) -> Result<()> {
        match ctx.channel {
            Channel::Ws | Channel::WsTest => self.send_ws(ctx, message).await,
            Channel::Instagram => self.send_instagram(ctx, message).await,
            Channel::WhatsappBusinessAccount => self.send_waba(ctx, message).await,
            Channel::Whatsapp => self.send_whatsapp(ctx, message).await,
        }
    }

    async fn publish_business_event(&self, business_id: Uuid, event: BusinessEvent) -> Result<()> {
        self.hub
            .publish_business(business_id, serde_json::to_value(&event)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        assert_eq!("instagram".parse::<Channel>().unwrap(), Channel::Instagram);
        assert_eq!(
            "whatsapp_business_account".parse::<Channel>().unwrap(),
            Channel::WhatsappBusinessAccount
        );
        assert_eq!(Channel::Ws.to_string(), "ws");
        assert!(Channel::WsTest.is_websocket());
        assert!(!Channel::Whatsapp.is_websocket());
    }

    #[tokio::test]
    async fn hub_delivers_to_subscribers() {
        let hub = WsHub::new();
        let agent_id = Uuid::now_v7();
        let mut rx = hub.subscribe_agent(agent_id).await;

        hub.publish_agent(agent_id, serde_json::json!({ "type": "ai_response" }))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "ai_response");
    }

    #[tokio::test]
    async fn hub_publish_without_subscribers_is_ok() {
        let hub = WsHub::new();
        assert!(hub
            .publish_business(Uuid::now_v7(), serde_json::json!({ "type": "mark_read" }))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn ws_send_publishes_ai_response() {
        let hub = std::sync::Arc::new(WsHub::new());
        let router = ChannelRouter::new(hub.clone());
        let agent_id = Uuid::now_v7();
        let mut rx = hub.subscribe_agent(agent_id).await;

        let ctx = SendContext {
            channel: Channel::Ws,
            business_id: Uuid::now_v7(),
            agent_id,
            customer_id: "c-1".into(),
            thread_id: Some("t-1".into()),
            project_id: None,
            phone_number_id: None,
            access_token: None,
        };
        router
            .send(
                &ctx,
                &OutboundMessage {
                    message_id: Some("msg-1".into()),
                    text: "Здравствуйте!".into(),
                    image_url: None,
                    tools: vec![],
                },
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "ai_response");
        assert_eq!(event["message"]["text_response"], "Здравствуйте!");
        assert_eq!(event["message"]["message_id"], "msg-1");
        assert_eq!(event["thread_id"], "t-1");
    }
}
