use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::message::Notification;

/// Callback invoked for every notification addressed to an entity.
///
/// Handlers run inline on the channel's reader thread and must not block.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Maps entity ids to notification handlers.
///
/// The registry never owns entities; it only knows where to deliver. Entities
/// register themselves on creation and unregister before they go away.
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    handlers: Arc<DashMap<String, NotificationHandler>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `entity_id` with `handler`, replacing any previous handler.
    pub fn register(
        &self,
        entity_id: impl Into<String>,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
    ) {
        let entity_id = entity_id.into();
        debug!(entity_id = %entity_id, "entity registered");
        if self
            .handlers
            .insert(entity_id.clone(), Arc::new(handler))
            .is_some()
        {
            debug!(entity_id = %entity_id, "replaced existing notification handler");
        }
    }

    /// Remove the association. Unknown ids are ignored.
    pub fn unregister(&self, entity_id: &str) -> bool {
        let removed = self.handlers.remove(entity_id).is_some();
        if removed {
            debug!(entity_id, "entity unregistered");
        }
        removed
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.handlers.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver a notification to its target. Returns whether a handler ran.
    ///
    /// The handler is cloned out of the map before it runs, so it may register
    /// or unregister entities (itself included) without deadlocking.
    pub fn dispatch(&self, notification: &Notification) -> bool {
        let handler = self
            .handlers
            .get(notification.target_id.as_str())
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => {
                warn!(
                    target_id = %notification.target_id,
                    event = %notification.event,
                    "notification for unknown entity dropped"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.handlers.len())
            .finish()
    }
}
