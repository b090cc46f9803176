//! Wiring of the gateway components.

use crate::credentials::CredentialCipher;
use crate::dispatch::MessageDispatcher;
use crate::fanout::{Fanout, FanoutConfig, TopicRouter};
use crate::pool::ConnectionPool;
use crate::provisioner::AdminProvisioner;
use crate::registry::VehicleRegistry;
use crate::store::Stores;
use crate::typing::{ChatStateMachine, DEFAULT_DEBOUNCE};
use plate_transport::{Connector, Credentials, InboundHandler};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Domain appended to principals when addressing stanzas.
    pub domain: String,
    pub admin: Credentials,
    pub debounce: Duration,
    pub fanout: FanoutConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            admin: Credentials::new("admin", "admin"),
            debounce: DEFAULT_DEBOUNCE,
            fanout: FanoutConfig::default(),
        }
    }
}

/// A running gateway: pool, registry, chat-state machine, dispatcher and
/// the local topic router they publish to.
pub struct Gateway {
    pool: Arc<ConnectionPool>,
    registry: Arc<VehicleRegistry>,
    chat_states: ChatStateMachine,
    dispatcher: Arc<MessageDispatcher>,
    fanout: Arc<TopicRouter>,
}

impl Gateway {
    /// Build the gateway and route inbound stanzas to its dispatcher.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        stores: Stores,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Self {
        let fanout = Arc::new(TopicRouter::with_config(config.fanout));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&connector), config.admin));
        let provisioner = Arc::new(AdminProvisioner::new(Arc::clone(&pool)));
        let registry = Arc::new(VehicleRegistry::new(
            stores.vehicles,
            stores.credentials,
            cipher,
            provisioner,
            Arc::clone(&pool),
        ));

        let publisher: Arc<dyn Fanout> = fanout.clone();
        let chat_states = ChatStateMachine::new(
            Arc::clone(&registry),
            stores.chat_states,
            Arc::clone(&publisher),
            config.domain.as_str(),
            config.debounce,
        );
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&registry),
            stores.messages,
            publisher,
            config.domain.as_str(),
        ));

        let inbound: Arc<dyn InboundHandler> = dispatcher.clone();
        connector.set_inbound_handler(&inbound);

        info!(domain = %config.domain, debounce_ms = config.debounce.as_millis() as u64, "Gateway ready");
        Self {
            pool,
            registry,
            chat_states,
            dispatcher,
            fanout,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<VehicleRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn chat_states(&self) -> &ChatStateMachine {
        &self.chat_states
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn fanout(&self) -> &Arc<TopicRouter> {
        &self.fanout
    }

    /// Cancel scheduled chat states and close every pooled session.
    pub async fn shutdown(&self) {
        self.chat_states.shutdown();
        self.pool.shutdown_all().await;
        info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{ChatStateRequest, MessageRequest, MessageResponse};
    use crate::testkit::{gateway, FakeServer};
    use plate_protocol::ChatStateSignal;
    use plate_transport::Session;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_register_send_and_type() {
        let server = FakeServer::new();
        let gateway = gateway(&server);
        gateway.registry().register("u", "34ABC123").await.unwrap();
        gateway.registry().register("u", "06XY42").await.unwrap();
        let mut messages = gateway.fanout().subscribe("ui", "messages/06XY42").unwrap();
        let mut typing = gateway.fanout().subscribe("ui", "chat-state/06XY42").unwrap();

        gateway
            .chat_states()
            .submit(ChatStateRequest::new("34ABC123", "06XY42", "COMPOSING"))
            .await;
        let response = gateway
            .dispatcher()
            .send(MessageRequest::text("34ABC123", "06XY42", "on my way"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(response.is_delivered);
        assert!(response.stanza_id.is_some());
        let published: MessageResponse =
            serde_json::from_slice(&messages.try_recv().unwrap().payload).unwrap();
        assert_eq!(published.id, response.id);

        let states: Vec<ChatStateRequest> = std::iter::from_fn(|| typing.try_recv().ok())
            .map(|p| serde_json::from_slice(&p.payload).unwrap())
            .collect();
        assert_eq!(
            states.iter().map(|s| s.state.as_str()).collect::<Vec<_>>(),
            vec!["COMPOSING", "PAUSED"]
        );
        assert_eq!(
            server.chat_states_sent("34ABC123"),
            vec![ChatStateSignal::Composing, ChatStateSignal::Paused]
        );
        assert_eq!(server.connect_count("34ABC123"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let server = FakeServer::new();
        let gateway = gateway(&server);
        gateway.registry().register("u", "34ABC123").await.unwrap();
        let session = gateway.registry().session("34ABC123").await.unwrap();

        gateway.shutdown().await;
        assert!(!session.is_live());
        assert!(gateway.pool().is_empty());
    }
}
