use crate::agent::MessageHandler;
use crate::engine::Orchestrator;
use crate::types::{ContextMap, Message, MessageType};
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Orchestrator {
    /// Queue a message for delivery. Also published to the broker, if any.
    pub async fn send_message(&self, message: Message) -> JobSwitchResult<Uuid> {
        if message.recipient_id.trim().is_empty() {
            return Err(JobSwitchError::Validation("Message recipient must not be empty".into()));
        }
        let id = message.id;
        debug!(
            message_id = %id,
            sender_id = %message.sender_id,
            recipient_id = %message.recipient_id,
            message_type = ?message.message_type,
            "Message queued"
        );
        self.publish_in_background(&message);
        self.shared.messages.lock().await.push_back(message);
        self.shared.message_wakeup.notify_one();
        Ok(id)
    }

    /// Send one broadcast message to every registered agent except the sender.
    pub async fn broadcast_message(
        &self,
        sender_id: &str,
        payload: serde_json::Value,
    ) -> JobSwitchResult<Vec<Uuid>> {
        let recipients: Vec<String> = self
            .agent_ids()
            .await
            .into_iter()
            .filter(|id| id != sender_id)
            .collect();
        let mut ids = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let message = Message::new(sender_id, recipient, MessageType::Broadcast, payload.clone());
            ids.push(self.send_message(message).await?);
        }
        info!(sender_id = %sender_id, recipients = ids.len(), "Broadcast queued");
        Ok(ids)
    }

    /// Fire-and-forget publish to `agent:{recipient_id}`.
    fn publish_in_background(&self, message: &Message) {
        let Some(broker) = self.active_broker() else {
            return;
        };
        let topic = self.shared.config.cache.topic_for(&message.recipient_id);
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Failed to serialize message");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = broker.publish(&topic, &payload).await {
                warn!(topic = %topic, error = %e, "Failed to publish message");
            }
        });
    }

    /// Add a handler invoked for every message delivered to `agent_id`.
    pub async fn register_message_handler(
        &self,
        agent_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> JobSwitchResult<()> {
        if !self.is_registered(agent_id).await {
            return Err(JobSwitchError::agent(agent_id, "agent not registered"));
        }
        self.shared
            .handlers
            .write()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .push(handler);
        debug!(agent_id = %agent_id, "Message handler registered");
        Ok(())
    }

    pub(crate) async fn delivery_loop(self) {
        let interval = self.shared.config.dispatch_interval();
        debug!("Message delivery loop started");
        while self.is_running() {
            loop {
                let next = self.shared.messages.lock().await.pop_front();
                let Some(message) = next else {
                    break;
                };
                self.deliver(message).await;
            }
            tokio::select! {
                _ = self.shared.message_wakeup.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Message delivery loop stopped");
    }

    async fn deliver(&self, mut message: Message) {
        message.delivered = true;
        self.shared.delivered_messages.fetch_add(1, Ordering::SeqCst);

        let handlers = self
            .shared
            .handlers
            .read()
            .await
            .get(&message.recipient_id)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            if let Err(e) = handler.handle(&message).await {
                warn!(
                    message_id = %message.id,
                    recipient_id = %message.recipient_id,
                    error = %e,
                    "Message handler failed"
                );
            }
        }

        if message.message_type == MessageType::ContextUpdate {
            let Some(agent) = self.agent(&message.recipient_id).await else {
                debug!(recipient_id = %message.recipient_id, "Context update for unregistered agent dropped");
                return;
            };
            let update = message
                .payload
                .get("update")
                .and_then(|u| u.as_object())
                .cloned()
                .unwrap_or_default();
            if let Err(e) = agent.update_context(&update).await {
                warn!(agent_id = %message.recipient_id, error = %e, "Agent rejected context update");
            }
        }
    }

    // --- Shared context ---

    pub async fn subscribe_to_context(&self, agent_id: &str, context_key: &str) -> JobSwitchResult<()> {
        if !self.is_registered(agent_id).await {
            return Err(JobSwitchError::agent(agent_id, "agent not registered"));
        }
        self.shared.context.write().await.subscribe(agent_id, context_key);
        debug!(agent_id = %agent_id, context_key = %context_key, "Subscribed to context");
        Ok(())
    }

    pub async fn unsubscribe_from_context(&self, agent_id: &str, context_key: &str) -> bool {
        self.shared.context.write().await.unsubscribe(agent_id, context_key)
    }

    pub async fn get_shared_context(&self, context_key: &str) -> Option<ContextMap> {
        self.shared.context.read().await.get(context_key).cloned()
    }

    /// Merge `update` into a shared context and notify its subscribers.
    ///
    /// The sender is not notified. Returns the number of messages queued.
    pub async fn broadcast_context_update(
        &self,
        context_key: &str,
        update: ContextMap,
        sender_id: &str,
    ) -> JobSwitchResult<usize> {
        let subscribers = {
            let mut context = self.shared.context.write().await;
            context.merge(context_key, &update);
            context.subscribers(context_key)
        };

        let payload = serde_json::json!({
            "context_key": context_key,
            "update": update,
        });
        let mut sent = 0;
        for subscriber in subscribers.into_iter().filter(|id| id != sender_id) {
            let message = Message::new(sender_id, subscriber, MessageType::ContextUpdate, payload.clone());
            self.send_message(message).await?;
            sent += 1;
        }
        info!(context_key = %context_key, sender_id = %sender_id, recipients = sent, "Context update broadcast");
        Ok(sent)
    }
}
