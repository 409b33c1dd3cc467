use std::collections::HashMap;

use log::trace;

use crate::{
    error::Error,
    ubx::{Message, MessageKind},
};

/// Anything interested in decoded [Message]s.
/// Implementors match on the [Message] variants they were registered for.
pub trait Handler: Send {
    fn handle(&mut self, msg: &Message) -> Result<(), Error>;
}

/// Index of a registered [Handler]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandlerId(usize);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler #{}", self.0)
    }
}

/// Routes each [MessageKind] to the [Handler]s registered for it,
/// in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn Handler>>,
    routes: HashMap<MessageKind, Vec<usize>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers [Handler] for all given kinds.
    pub fn register<H: Handler + 'static>(&mut self, handler: H, kinds: &[MessageKind]) -> HandlerId {
        let index = self.handlers.len();
        self.handlers.push(Box::new(handler));

        for kind in kinds {
            let route = self.routes.entry(*kind).or_default();
            if !route.contains(&index) {
                route.push(index);
            }
        }

        HandlerId(index)
    }

    /// Number of handlers registered for this kind
    #[cfg(test)]
    pub fn count(&self, kind: MessageKind) -> usize {
        self.routes.get(&kind).map_or(0, |route| route.len())
    }

    /// Visits every [Handler] registered for exactly this kind.
    /// Stops at the first error returned by the visitor.
    pub fn for_each_handler<F>(&mut self, kind: MessageKind, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&mut dyn Handler) -> Result<(), Error>,
    {
        let Some(route) = self.routes.get(&kind) else {
            trace!(target: "registry", "no handler for {:?}", kind);
            return Ok(());
        };

        for index in route {
            visit(self.handlers[*index].as_mut())?;
        }

        Ok(())
    }

    /// Hands this [Message] to all interested [Handler]s.
    pub fn dispatch(&mut self, msg: &Message) -> Result<(), Error> {
        self.for_each_handler(msg.kind(), |handler| handler.handle(msg))
    }
}
