//! Caller-side batching context for outgoing messages.
//!
//! An outbox collects the messages a caller produces while handling one
//! message, then [`flush`](Outbox::flush) routes each to its target mailbox
//! and wakes every touched mailbox once. Workers thread their own outbox
//! through every invocation; code outside a worker uses
//! [`Outbox::scoped`], which acquires a transient outbox, runs the closure,
//! and flushes on the way out — an explicit scoped resource rather than a
//! hidden thread-local.
//!
//! The current-inbox slot records which mailbox the caller is executing in,
//! so queries constructed here can route their replies back into the caller's
//! own mailbox.

use crate::mailbox::inbox::Inbox;
use crate::messaging::message::Message;
use std::sync::Arc;

/// Batching context for a caller's outgoing messages.
pub struct Outbox {
    pending: Vec<Message>,
    current_inbox: Option<Arc<Inbox>>,
}

impl Outbox {
    /// Outbox bound to a worker's own mailbox.
    pub(crate) fn for_worker(inbox: Arc<Inbox>) -> Self {
        Self {
            pending: Vec::new(),
            current_inbox: Some(inbox),
        }
    }

    /// Outbox with no surrounding mailbox; completions for queries sent from
    /// here are delivered in place instead of through a reply hop.
    pub fn detached() -> Self {
        Self {
            pending: Vec::new(),
            current_inbox: None,
        }
    }

    /// Run `f` with a transient outbox, flushing on every normal exit path.
    pub fn scoped<R>(f: impl FnOnce(&mut Outbox) -> R) -> R {
        let mut outbox = Outbox::detached();
        let result = f(&mut outbox);
        outbox.flush();
        result
    }

    /// Queue a message for the next flush.
    pub fn offer(&mut self, message: Message) {
        self.pending.push(message);
    }

    /// Deliver every queued message to its target mailbox, waking each
    /// touched mailbox once.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let mut touched: Vec<Arc<Inbox>> = Vec::new();
        for message in self.pending.drain(..) {
            let target = message.target();
            target.offer(message);
            if !touched.iter().any(|inbox| inbox.id() == target.id()) {
                touched.push(target);
            }
        }

        for inbox in touched {
            inbox.wake();
        }
    }

    /// Messages queued and not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The mailbox this outbox is executing in, if any.
    pub fn current_inbox(&self) -> Option<&Arc<Inbox>> {
        self.current_inbox.as_ref()
    }

    /// Swap the current-inbox slot, returning the previous value. Used when a
    /// completion must run as if inside another mailbox's context.
    pub fn set_current_inbox(&mut self, inbox: Option<Arc<Inbox>>) -> Option<Arc<Inbox>> {
        std::mem::replace(&mut self.current_inbox, inbox)
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                pending = self.pending.len(),
                "outbox dropped with unflushed messages"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::inbox::Inbox;
    use crate::messaging::headers::Headers;
    use crate::messaging::message::SendMessage;
    use crate::query::table::QueryTable;

    fn inbox(address: &str) -> Arc<Inbox> {
        Inbox::new(address.to_string(), Arc::new(QueryTable::new(8)))
    }

    fn send_to(target: &Arc<Inbox>) -> Message {
        Message::Send(SendMessage::new(
            target.clone(),
            Headers::new(),
            "ping",
            vec![],
        ))
    }

    #[test]
    fn test_flush_routes_to_targets() {
        let a = inbox("local://a");
        let b = inbox("local://b");

        let mut outbox = Outbox::detached();
        outbox.offer(send_to(&a));
        outbox.offer(send_to(&b));
        outbox.offer(send_to(&a));
        assert_eq!(outbox.pending_count(), 3);

        outbox.flush();
        assert_eq!(outbox.pending_count(), 0);
        assert_eq!(a.queued(), 2);
        assert_eq!(b.queued(), 1);
    }

    #[test]
    fn test_scoped_flushes_on_exit() {
        let target = inbox("local://scoped");

        let result = Outbox::scoped(|outbox| {
            outbox.offer(send_to(&target));
            assert_eq!(target.queued(), 0);
            "done"
        });

        assert_eq!(result, "done");
        assert_eq!(target.queued(), 1);
    }

    #[test]
    fn test_current_inbox_slot() {
        let a = inbox("local://a");
        let b = inbox("local://b");

        let mut outbox = Outbox::for_worker(a.clone());
        assert_eq!(outbox.current_inbox().map(|i| i.id()), Some(a.id()));

        let previous = outbox.set_current_inbox(Some(b.clone()));
        assert_eq!(previous.map(|i| i.id()), Some(a.id()));
        assert_eq!(outbox.current_inbox().map(|i| i.id()), Some(b.id()));
    }
}
