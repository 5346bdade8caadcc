//! Handler trait, execution context, and the handler registry.
//!
//! Handlers are keyed by message type string. The registry keeps an ordered
//! list per type (multiple handlers are allowed) behind a copy-on-write
//! snapshot, so reads during dispatch never contend with registration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::MessengerError;
use crate::message::Message;
use crate::validate::is_valid_message_type;

/// Per-attempt execution context handed to handlers and middleware.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Id of the envelope being processed.
    pub message_id: Uuid,
    /// Handler-observed failures before this attempt.
    pub retry_count: u32,
    /// Queue the envelope was leased from.
    pub queue_name: String,
    /// Transport the envelope was leased from.
    pub transport_name: String,
    /// Cooperative cancellation; checked by long-running handlers.
    pub cancellation: CancellationToken,
}

/// A message handler.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// The message type this handler consumes.
    fn message_type(&self) -> &str;

    /// Identity used by targeted unregistration. Defaults to the type name.
    fn name(&self) -> &str {
        self.message_type()
    }

    /// Process one message. Return a [`crate::HandlerError`] to control
    /// retryability; any other error is classified by the transient-failure
    /// pattern set.
    async fn handle(&self, message: &Message, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    message_type: String,
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    /// Wrap `f` as a handler for `message_type`.
    pub fn new(message_type: impl Into<String>, f: F) -> Self {
        let message_type = message_type.into();
        Self {
            name: message_type.clone(),
            message_type,
            f,
        }
    }

    /// Set an explicit handler name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn message_type(&self) -> &str {
        &self.message_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &Message, ctx: &HandlerContext) -> anyhow::Result<()> {
        (self.f)(message.clone(), ctx.clone()).await
    }
}

type HandlerMap = HashMap<String, Vec<Arc<dyn Handler>>>;

/// Message-type → ordered handler list, with copy-on-write snapshots.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Arc<HandlerMap>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for its message type. Multiple handlers per type
    /// are allowed and run in registration order.
    pub fn register(&self, handler: Arc<dyn Handler>) -> Result<(), MessengerError> {
        let message_type = handler.message_type().to_string();
        if !is_valid_message_type(&message_type) {
            return Err(MessengerError::Validation(format!(
                "invalid message type {message_type:?}"
            )));
        }

        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        next.entry(message_type).or_default().push(handler);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove handlers for a type. With a name, removes only matching
    /// handlers; without, removes all. Returns whether anything was removed.
    pub fn unregister(&self, message_type: &str, name: Option<&str>) -> bool {
        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();

        let removed = match next.get_mut(message_type) {
            None => false,
            Some(list) => {
                let before = list.len();
                match name {
                    Some(name) => list.retain(|h| h.name() != name),
                    None => list.clear(),
                }
                let removed = list.len() != before;
                if list.is_empty() {
                    next.remove(message_type);
                }
                removed
            }
        };

        if removed {
            *guard = Arc::new(next);
        }
        removed
    }

    /// The first handler registered for a type.
    pub fn get_handler(&self, message_type: &str) -> Option<Arc<dyn Handler>> {
        self.snapshot()
            .get(message_type)
            .and_then(|list| list.first().cloned())
    }

    /// All handlers registered for a type, in registration order.
    pub fn get_handlers(&self, message_type: &str) -> Vec<Arc<dyn Handler>> {
        self.snapshot()
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any handler is registered for a type.
    pub fn has(&self, message_type: &str) -> bool {
        self.snapshot().contains_key(message_type)
    }

    /// All registered message types.
    pub fn registered_types(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    fn snapshot(&self) -> Arc<HandlerMap> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler(message_type: &str) -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(message_type, |_msg, _ctx| async { Ok(()) }))
    }

    fn context() -> HandlerContext {
        HandlerContext {
            message_id: Uuid::new_v4(),
            retry_count: 0,
            queue_name: "default".to_string(),
            transport_name: "sync".to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register(noop_handler("Echo")).unwrap();

        assert!(registry.has("Echo"));
        assert!(registry.get_handler("Echo").is_some());
        assert_eq!(registry.get_handlers("Echo").len(), 1);
        assert!(registry.get_handler("Other").is_none());
    }

    #[test]
    fn rejects_invalid_message_type() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(noop_handler("9bad")).is_err());
    }

    #[test]
    fn multiple_handlers_keep_registration_order() {
        let registry = HandlerRegistry::new();
        registry
            .register(Arc::new(
                FnHandler::new("Echo", |_m, _c| async { Ok(()) }).named("first"),
            ))
            .unwrap();
        registry
            .register(Arc::new(
                FnHandler::new("Echo", |_m, _c| async { Ok(()) }).named("second"),
            ))
            .unwrap();

        let handlers = registry.get_handlers("Echo");
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name(), "first");
        assert_eq!(registry.get_handler("Echo").unwrap().name(), "first");
    }

    #[test]
    fn unregister_by_name_and_wholesale() {
        let registry = HandlerRegistry::new();
        registry
            .register(Arc::new(
                FnHandler::new("Echo", |_m, _c| async { Ok(()) }).named("first"),
            ))
            .unwrap();
        registry
            .register(Arc::new(
                FnHandler::new("Echo", |_m, _c| async { Ok(()) }).named("second"),
            ))
            .unwrap();

        assert!(registry.unregister("Echo", Some("first")));
        assert_eq!(registry.get_handlers("Echo").len(), 1);

        assert!(registry.unregister("Echo", None));
        assert!(!registry.has("Echo"));
        assert!(!registry.unregister("Echo", None));
    }

    #[tokio::test]
    async fn fn_handler_invokes_closure() {
        let handler = FnHandler::new("Echo", |message: Message, _ctx| async move {
            assert_eq!(message.payload["n"], 1);
            Ok(())
        });
        let message = Message::new("Echo", json!({ "n": 1 }));
        handler.handle(&message, &context()).await.unwrap();
    }
}
