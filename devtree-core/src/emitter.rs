//! Subscriber list for loud mutations.

use std::fmt;

use crate::patch::Patch;

/// A published patch and the channel it belongs on.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    Update(Patch),
    Delete(Patch),
}

impl TreeEvent {
    pub fn patch(&self) -> &Patch {
        match self {
            TreeEvent::Update(p) | TreeEvent::Delete(p) => p,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, TreeEvent::Delete(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&TreeEvent) + Send>;

/// Handlers run synchronously, in subscription order.
#[derive(Default)]
pub(crate) struct Emitter {
    next_id: u64,
    handlers: Vec<(SubscriptionId, Handler)>,
}

impl Emitter {
    pub fn subscribe(&mut self, handler: impl FnMut(&TreeEvent) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(sid, _)| *sid != id);
        self.handlers.len() != before
    }

    pub fn emit(&mut self, event: TreeEvent) {
        if event.patch().is_empty() {
            return;
        }
        let channel = if event.is_delete() { "delete" } else { "update" };
        log::trace!("Publishing {channel} patch to {} subscribers", self.handlers.len());
        for (_, handler) in &mut self.handlers {
            handler(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("subscribers", &self.handlers.len())
            .finish()
    }
}
