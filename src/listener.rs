//! Per-message-id subscriber dispatch. Listeners are plain callback objects
//!  registered against a numeric message id and invoked synchronously, in
//!  registration order, with the parsed message.

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::message::{Message, Whence};

pub trait MessageListener {
    fn on_message(&mut self, message: &mut Message);
}

impl<F: FnMut(&mut Message)> MessageListener for F {
    fn on_message(&mut self, message: &mut Message) {
        self(message)
    }
}

#[derive(Default)]
pub struct SubscriberTable {
    listeners: FxHashMap<u32, Vec<Box<dyn MessageListener>>>,
}

impl SubscriberTable {
    pub fn new() -> SubscriberTable {
        Default::default()
    }

    pub fn listen(&mut self, message_id: u32, listener: Box<dyn MessageListener>) {
        self.listeners.entry(message_id).or_default().push(listener);
    }

    /// Invoke every listener registered for the message's id, rewinding the
    ///  cursor to `payload_offset` before each invocation so that every
    ///  listener pops the body from the start. Returns the number of
    ///  listeners invoked.
    pub fn dispatch(&mut self, message: &mut Message, payload_offset: usize) -> usize {
        let Some(listeners) = self.listeners.get_mut(&message.id()) else {
            trace!("no subscribers for message {:#x}", message.id());
            return 0;
        };

        for listener in listeners.iter_mut() {
            message.seek(payload_offset, Whence::Begin)
                .expect("this is a bug: the payload offset was a valid cursor position");
            listener.on_message(message);
        }
        listeners.len()
    }
}
