use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::QosLevel;
use crate::envelope::Envelope;
use crate::error::BusError;

/// Publishes envelopes to the broker.
///
/// The trait seam lets service logic run against a mock in tests and the
/// real MQTT transport in production.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish an envelope to a topic at the given QoS.
    async fn publish(&self, topic: &str, envelope: &Envelope, qos: QosLevel)
        -> Result<(), BusError>;
}

/// Blanket implementation so `Arc<dyn BusPublisher>` can be used directly.
#[async_trait]
impl<T: BusPublisher + ?Sized> BusPublisher for Arc<T> {
    async fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
        qos: QosLevel,
    ) -> Result<(), BusError> {
        (**self).publish(topic, envelope, qos).await
    }
}

/// Boxed async function invoked per decoded envelope on a subscribed topic.
///
/// Handlers receive the concrete topic alongside the envelope so wildcard
/// subscriptions can dispatch on the matched segment. Handlers must not
/// block on long work; push onto an internal queue instead.
pub type MessageHandler = Box<
    dyn Fn(String, Envelope) -> Pin<Box<dyn Future<Output = Result<(), alicia_core::AliciaError>> + Send>>
        + Send
        + Sync,
>;

/// Convenience for building a [`MessageHandler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(String, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), alicia_core::AliciaError>> + Send + 'static,
{
    Box::new(move |topic, env| Box::pin(f(topic, env)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use tokio::sync::Mutex;

    /// Mock publisher that records published envelopes.
    struct MockPublisher {
        published: Mutex<Vec<(String, Envelope)>>,
    }

    #[async_trait]
    impl BusPublisher for MockPublisher {
        async fn publish(
            &self,
            topic: &str,
            envelope: &Envelope,
            _qos: QosLevel,
        ) -> Result<(), BusError> {
            self.published
                .lock()
                .await
                .push((topic.to_string(), envelope.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn arc_publisher_usable_through_blanket_impl() {
        let publisher = Arc::new(MockPublisher {
            published: Mutex::new(Vec::new()),
        });

        let envelope = Envelope::event("test", serde_json::json!({"n": 1}));
        let as_dyn: Arc<dyn BusPublisher> = publisher.clone();
        as_dyn
            .publish("alicia/test", &envelope, QosLevel::AtLeastOnce)
            .await
            .unwrap();

        let published = publisher.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "alicia/test");
    }

    #[tokio::test]
    async fn handler_wraps_async_closures() {
        let h = handler(|topic, _env| async move {
            assert_eq!(topic, "alicia/test");
            Ok(())
        });
        let envelope = Envelope::event("test", serde_json::json!({}));
        h("alicia/test".to_string(), envelope).await.unwrap();
    }
}
