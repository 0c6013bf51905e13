//! Downstream binder contract: routing validated events to UI state.
//!
//! The sync core does not render anything. An external binding layer (scroll
//! sync, highlight overlays) registers a [`PanelBinder`] and receives decoded
//! entries through [`BinderRouter::dispatch`]. The router guarantees the
//! delivery contract: callbacks fire in increasing sequence order per
//! connection, and a sequence already delivered to a connection is never
//! delivered to it again. Idempotency is per connection, not global:
//! every connection receives the full ordered stream independently.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

use crate::event::{EventLogEntry, HIGHLIGHT_EVENT, SCROLL_EVENT};

/// Callback surface implemented by the UI binding layer.
pub trait PanelBinder: Send + Sync {
    /// Invoked for each in-order `scroll` event.
    fn on_scroll_event(&self, entry: &EventLogEntry);

    /// Invoked for each in-order `highlight` event.
    fn on_highlight_event(&self, entry: &EventLogEntry);
}

/// Fans validated, in-order events out to registered binders.
pub struct BinderRouter {
    binders: RwLock<Vec<Arc<dyn PanelBinder>>>,
    /// Highest sequence dispatched per connection id.
    delivered: DashMap<String, u64>,
}

impl BinderRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binders: RwLock::new(Vec::new()),
            delivered: DashMap::new(),
        }
    }

    /// Registers a binder for all subsequent dispatches.
    pub fn register(&self, binder: Arc<dyn PanelBinder>) {
        self.binders.write().push(binder);
    }

    /// Routes `entry` to binders on behalf of `connection_id`.
    ///
    /// Returns `false` (and invokes nothing) when the entry's sequence does
    /// not advance the connection's delivery high-water mark, or when its
    /// kind is not one the binder surface knows. Unknown kinds still advance
    /// the mark: the stream delivered them, the binders just have no hook.
    pub fn dispatch(&self, connection_id: &str, entry: &EventLogEntry) -> bool {
        let mut mark = self
            .delivered
            .entry(connection_id.to_string())
            .or_insert(0);
        if entry.sequence <= *mark {
            trace!(
                connection = connection_id,
                sequence = entry.sequence,
                "suppressed duplicate binder delivery"
            );
            return false;
        }
        *mark = entry.sequence;
        drop(mark);

        let routed = match entry.event_type.as_str() {
            SCROLL_EVENT => {
                for binder in self.binders.read().iter() {
                    binder.on_scroll_event(entry);
                }
                true
            }
            HIGHLIGHT_EVENT => {
                for binder in self.binders.read().iter() {
                    binder.on_highlight_event(entry);
                }
                true
            }
            _ => false,
        };
        routed
    }

    /// Drops the delivery mark for a closed connection.
    pub fn forget_connection(&self, connection_id: &str) {
        self.delivered.remove(connection_id);
    }
}

impl Default for BinderRouter {
    fn default() -> Self {
        Self::new()
    }
}
