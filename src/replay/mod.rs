//! Recording and replay of the UI messages a cached function emits
//!
//! While a cached function computes, every element and block it writes is
//! recorded together with the id of the destination it was written to. On a
//! cache hit the recorded messages are re-emitted in order. Destinations that
//! were created by the function itself are recreated during replay and mapped
//! from their recorded ids; everything else must resolve to the main area or
//! the sidebar.

mod messages;

pub use messages::{
    BlockMsgData, CachedResult, ElementMsgData, MediaMsgData, MsgData, WidgetMsgMetadata,
};

use crate::error::{CacheError, Result};
use crate::logging::{operations, services, status};
use crate::runtime::{DestinationRef, Payload, RunContext};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug)]
struct RecordingScope {
    func_name: String,
    allow_widgets: bool,
    messages: Vec<MsgData>,
    /// Destinations produced while this scope was recording
    seen_ids: HashSet<String>,
}

#[derive(Debug, Default)]
struct RecorderState {
    scopes: Vec<RecordingScope>,
    pending_media: Vec<MediaMsgData>,
    pending_widget: Option<WidgetMsgMetadata>,
    in_cached_function: bool,
    suppress_widget_warning: usize,
}

/// Per-run recorder of messages emitted inside cached functions
///
/// Owned by the [`RunContext`] so concurrent sessions never share recordings.
#[derive(Debug, Default)]
pub struct MessageReplayContext {
    state: Mutex<RecorderState>,
}

impl MessageReplayContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a recording scope for `func_name`
    ///
    /// Messages saved while the guard is alive are appended to this scope and
    /// every enclosing one. Call [`RecordingGuard::finish`] to collect them;
    /// dropping the guard instead discards them.
    pub fn calling_cached_function(&self, func_name: &str, allow_widgets: bool) -> RecordingGuard<'_> {
        let mut state = self.state.lock();
        let nested = state.in_cached_function;
        state.in_cached_function = true;
        state.scopes.push(RecordingScope {
            func_name: func_name.to_string(),
            allow_widgets,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
        });

        RecordingGuard {
            context: self,
            nested,
            finished: false,
        }
    }

    /// True while any cached function on this run is computing
    pub fn in_cached_function(&self) -> bool {
        self.state.lock().in_cached_function
    }

    pub fn is_recording(&self) -> bool {
        !self.state.lock().scopes.is_empty()
    }

    /// Record an element emission
    ///
    /// Media and widget metadata saved since the previous element are attached
    /// to this one.
    pub fn save_element_message(
        &self,
        delta_type: &str,
        payload: &Payload,
        invoked_on_id: &str,
        used_on_id: &str,
        produced_id: &str,
    ) {
        let mut state = self.state.lock();
        let media = std::mem::take(&mut state.pending_media);
        let widget = state.pending_widget.take();
        if state.scopes.is_empty() {
            return;
        }

        let invoked_on_id = select_id(&state, invoked_on_id, used_on_id);
        let message = MsgData::Element(ElementMsgData {
            delta_type: delta_type.to_string(),
            payload: payload.clone(),
            invoked_on_id,
            used_on_id: used_on_id.to_string(),
            produced_id: produced_id.to_string(),
            media,
            widget,
        });
        push_message(&mut state, message);
    }

    /// Record a block emission
    pub fn save_block_message(
        &self,
        payload: &Payload,
        invoked_on_id: &str,
        used_on_id: &str,
        produced_id: &str,
    ) {
        let mut state = self.state.lock();
        if state.scopes.is_empty() {
            return;
        }

        let invoked_on_id = select_id(&state, invoked_on_id, used_on_id);
        let message = MsgData::Block(BlockMsgData {
            payload: payload.clone(),
            invoked_on_id,
            used_on_id: used_on_id.to_string(),
            produced_id: produced_id.to_string(),
        });
        push_message(&mut state, message);
    }

    /// Attach media to the next recorded element
    pub fn save_media_data(&self, data: &[u8], mimetype: &str, media_id: &str) {
        let mut state = self.state.lock();
        if state.scopes.is_empty() {
            return;
        }
        state.pending_media.push(MediaMsgData {
            data: data.to_vec(),
            mimetype: mimetype.to_string(),
            media_id: media_id.to_string(),
        });
    }

    /// Attach widget metadata to the next recorded element
    pub fn save_widget_metadata(&self, metadata: WidgetMsgMetadata) {
        let mut state = self.state.lock();
        if state.scopes.is_empty() {
            return;
        }
        state.pending_widget = Some(metadata);
    }

    /// Destination id to record for a message
    ///
    /// The used destination is kept when the current scope produced it;
    /// otherwise the invoked one is, so a redirect into a block created
    /// outside the cached function is not baked into the recording.
    pub fn select_dg_to_save(&self, invoked_on_id: &str, used_on_id: &str) -> String {
        select_id(&self.state.lock(), invoked_on_id, used_on_id)
    }

    /// Fail if a widget is created inside a cached function that does not allow them
    pub fn check_widget_allowed(&self, widget_name: &str) -> Result<()> {
        let state = self.state.lock();
        let Some(top) = state.scopes.last() else {
            return Ok(());
        };
        if state.suppress_widget_warning > 0 || state.scopes.iter().any(|s| s.allow_widgets) {
            return Ok(());
        }

        Err(CacheError::WidgetInCachedFunction {
            func_name: top.func_name.clone(),
            widget: widget_name.to_string(),
        })
    }

    /// Allow widgets while the guard is alive, even in cached functions that
    /// would reject them
    pub fn suppress_widget_warning(&self) -> SuppressWidgetGuard<'_> {
        self.state.lock().suppress_widget_warning += 1;
        SuppressWidgetGuard { context: self }
    }

    fn pop_scope(&self, nested: bool) -> Vec<MsgData> {
        let mut state = self.state.lock();
        let messages = state
            .scopes
            .pop()
            .map(|scope| scope.messages)
            .unwrap_or_default();

        if !nested {
            state.in_cached_function = false;
            state.pending_media.clear();
            state.pending_widget = None;
        }
        messages
    }
}

fn select_id(state: &RecorderState, invoked_on_id: &str, used_on_id: &str) -> String {
    match state.scopes.last() {
        Some(scope) if scope.seen_ids.contains(used_on_id) => used_on_id.to_string(),
        _ => invoked_on_id.to_string(),
    }
}

fn push_message(state: &mut RecorderState, message: MsgData) {
    let produced_id = message.produced_id().to_string();
    for scope in &mut state.scopes {
        scope.seen_ids.insert(produced_id.clone());
        scope.messages.push(message.clone());
    }
}

/// Open recording scope, see [`MessageReplayContext::calling_cached_function`]
#[must_use = "dropping the guard discards the recording"]
pub struct RecordingGuard<'a> {
    context: &'a MessageReplayContext,
    nested: bool,
    finished: bool,
}

impl RecordingGuard<'_> {
    /// Close the scope and return the messages it recorded
    pub fn finish(mut self) -> Vec<MsgData> {
        self.finished = true;
        self.context.pop_scope(self.nested)
    }
}

impl Drop for RecordingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let discarded = self.context.pop_scope(self.nested);
            debug!(
                service = services::REPLAY,
                message_count = discarded.len(),
                "discarded recording of a cached function that did not complete"
            );
        }
    }
}

pub struct SuppressWidgetGuard<'a> {
    context: &'a MessageReplayContext,
}

impl Drop for SuppressWidgetGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.context.state.lock();
        state.suppress_widget_warning = state.suppress_widget_warning.saturating_sub(1);
    }
}

/// Re-emit the messages of a cached result into the current run
///
/// Media is registered and widgets re-registered before their element is
/// emitted. A message whose destination can't be resolved fails with
/// [`CacheError::ReplayClosure`].
pub fn replay_cached_messages<V>(
    result: &CachedResult<V>,
    ctx: &dyn RunContext,
    func_name: &str,
) -> Result<()> {
    let mut destinations: HashMap<String, DestinationRef> = HashMap::new();
    destinations.insert(result.main_id.clone(), ctx.main());
    destinations.insert(result.sidebar_id.clone(), ctx.sidebar());

    for message in &result.messages {
        match message {
            MsgData::Element(element) => {
                for media in &element.media {
                    ctx.media_store()
                        .register(&media.data, &media.mimetype, &media.media_id);
                }
                if let Some(widget) = &element.widget {
                    ctx.register_widget(widget);
                }

                let destination = resolve(&destinations, &element.invoked_on_id, func_name)?;
                if let Some(produced) = destination.enqueue(&element.delta_type, &element.payload) {
                    destinations.insert(element.produced_id.clone(), produced);
                }
            }
            MsgData::Block(block) => {
                let destination = resolve(&destinations, &block.invoked_on_id, func_name)?;
                let produced = destination.open_block(&block.payload);
                destinations.insert(block.produced_id.clone(), produced);
            }
        }
    }

    debug!(
        service = services::REPLAY,
        operation = operations::REPLAY,
        status = status::SUCCESS,
        function = %func_name,
        session = %ctx.session_id(),
        message_count = result.messages.len(),
        "replayed cached messages"
    );
    Ok(())
}

fn resolve(
    destinations: &HashMap<String, DestinationRef>,
    id: &str,
    func_name: &str,
) -> Result<DestinationRef> {
    destinations
        .get(id)
        .cloned()
        .ok_or_else(|| CacheError::ReplayClosure {
            func_name: func_name.to_string(),
            destination_id: id.to_string(),
        })
}
