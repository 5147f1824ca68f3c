//! Consumer-side request/reply correlation
//!
//! Outbound commands carry a unique `MessageId`; the matching reply invokes
//! the registered callback. Entries leave the map when the reply arrives,
//! when the owning connection disconnects, or on cancellation. Cancellation
//! is side-effect-free on the wire: nothing is sent, the local callback is
//! simply suppressed.

use std::collections::HashMap;

use kas_wire::{MessageId, ProtocolMessage};

use crate::server_id::ServerId;

type ReplyCallback = Box<dyn FnOnce(ProtocolMessage) + Send>;

struct PendingRequest {
    server: ServerId,
    tag: Option<String>,
    callback: ReplyCallback,
}

/// Map of in-flight requests awaiting replies.
///
/// Allocates message IDs monotonically, skipping the reserved role-selection
/// ID; an ID is present in the map at most once.
pub struct PendingRequests {
    next_id: u32,
    entries: HashMap<MessageId, PendingRequest>,
}

impl PendingRequests {
    /// Create an empty map
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Register a callback for the reply to a new request, returning the ID
    /// to stamp on the outbound message.
    pub fn register(
        &mut self,
        server: ServerId,
        tag: Option<String>,
        callback: impl FnOnce(ProtocolMessage) + Send + 'static,
    ) -> MessageId {
        loop {
            let id = MessageId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == MessageId::ROLE_SELECT.as_u32() {
                self.next_id = 1;
            }
            if id != MessageId::ROLE_SELECT && !self.entries.contains_key(&id) {
                self.entries.insert(
                    id,
                    PendingRequest {
                        server,
                        tag,
                        callback: Box::new(callback),
                    },
                );
                return id;
            }
        }
    }

    /// Deliver a reply: runs and removes the matching callback.
    ///
    /// Returns false if no request with that ID is pending (already
    /// completed, cancelled, or dropped on disconnect).
    pub fn complete(&mut self, reply: ProtocolMessage) -> bool {
        match self.entries.remove(&reply.id) {
            Some(pending) => {
                (pending.callback)(reply);
                true
            }
            None => {
                tracing::trace!("No pending request for reply {}", reply.id);
                false
            }
        }
    }

    /// Cancel a request, suppressing its callback. No wire traffic results.
    pub fn cancel(&mut self, id: MessageId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Drop every request owned by a disconnected server.
    pub fn drop_for_server(&mut self, server: &ServerId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, pending| pending.server != *server);
        before - self.entries.len()
    }

    /// The tag registered with a pending request, if any.
    pub fn tag(&self, id: MessageId) -> Option<&str> {
        self.entries.get(&id)?.tag.as_deref()
    }

    /// Whether a request with this ID is pending.
    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn server_a() -> ServerId {
        ServerId::new("a.example.com", 8471)
    }

    fn server_b() -> ServerId {
        ServerId::new("b.example.com", 8471)
    }

    fn reply(id: MessageId) -> ProtocolMessage {
        ProtocolMessage::new(id, Bytes::from_static(b"reply"))
    }

    #[test]
    fn test_complete_runs_callback_once() {
        let mut pending = PendingRequests::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let id = pending.register(server_a(), None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pending.complete(reply(id)));
        assert!(!pending.complete(reply(id)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_cancel_suppresses_callback() {
        let mut pending = PendingRequests::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let id = pending.register(server_a(), Some("invite".into()), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(pending.tag(id), Some("invite"));

        assert!(pending.cancel(id));
        assert!(!pending.cancel(id));
        assert!(!pending.complete(reply(id)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_for_server_is_selective() {
        let mut pending = PendingRequests::new();
        pending.register(server_a(), None, |_| {});
        pending.register(server_b(), None, |_| {});
        pending.register(server_a(), None, |_| {});

        assert_eq!(pending.drop_for_server(&server_a()), 2);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_ids_skip_reserved_and_stay_unique() {
        let mut pending = PendingRequests {
            next_id: u32::MAX,
            entries: HashMap::new(),
        };

        let a = pending.register(server_a(), None, |_| {});
        let b = pending.register(server_a(), None, |_| {});

        assert_eq!(a, MessageId::new(u32::MAX));
        assert_ne!(b, MessageId::ROLE_SELECT);
        assert_ne!(a, b);
        assert!(pending.contains(a));
        assert!(pending.contains(b));
    }
}
