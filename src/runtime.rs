//! Interfaces the cache consumes from the script runtime
//!
//! The cache never renders anything itself. It sees the UI through three
//! seams: [`Destination`] (a place messages are written to), [`MediaStore`]
//! and [`RunContext`] (the state of the script run currently executing).

use crate::replay::{MessageReplayContext, WidgetMsgMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Encoded UI message, opaque to the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

pub type DestinationRef = Arc<dyn Destination>;

/// A container in the UI tree that accepts elements and blocks
///
/// Implementations must report every emission to the active run's
/// [`MessageReplayContext`] with `save_element_message` or
/// `save_block_message`. The invoked id is the id of the destination the
/// caller wrote to; the used id is the id of the destination that actually
/// received the message, which differs when writes to the main area are
/// redirected into an enclosing block. Replayed messages go through the same
/// path, so an outer cached function records the output of inner cache hits.
pub trait Destination: Send + Sync {
    fn id(&self) -> &str;

    /// Append an element. Returns a destination when the element can itself be
    /// written into.
    fn enqueue(&self, delta_type: &str, payload: &Payload) -> Option<DestinationRef>;

    /// Append a block and return it as a new destination
    fn open_block(&self, payload: &Payload) -> DestinationRef;
}

/// Session-scoped registry of media referenced by elements
pub trait MediaStore: Send + Sync {
    fn register(&self, data: &[u8], mimetype: &str, media_id: &str);
}

/// The script run a cached function is called from
pub trait RunContext: Send + Sync {
    fn session_id(&self) -> &str;

    /// Root destination of the main area
    fn main(&self) -> DestinationRef;

    /// Root destination of the sidebar
    fn sidebar(&self) -> DestinationRef;

    /// Current value of a widget in this session, if it exists
    fn widget_value(&self, widget_id: &str) -> Option<Value>;

    /// Re-register a widget whose element was replayed from the cache
    fn register_widget(&self, metadata: &WidgetMsgMetadata);

    fn media_store(&self) -> &dyn MediaStore;

    fn replay_context(&self) -> &MessageReplayContext;

    fn begin_spinner(&self, _message: &str) {}

    fn end_spinner(&self) {}
}

/// Keeps a spinner visible until dropped
pub(crate) struct SpinnerGuard<'a> {
    ctx: &'a dyn RunContext,
}

impl<'a> SpinnerGuard<'a> {
    pub(crate) fn start(ctx: &'a dyn RunContext, message: &str) -> Self {
        ctx.begin_spinner(message);
        Self { ctx }
    }
}

impl Drop for SpinnerGuard<'_> {
    fn drop(&mut self) {
        self.ctx.end_spinner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_conversions() {
        let payload = Payload::from("hello");
        assert_eq!(payload.as_bytes(), b"hello");
        assert_eq!(payload.len(), 5);
        assert_eq!(Payload::from(b"hello".to_vec()), payload);
        assert!(Payload::default().is_empty());
    }
}
