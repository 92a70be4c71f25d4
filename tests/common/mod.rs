// Common test utilities shared across acceptance tests
//
// ## Fake Script Runtime
//
// The cache only sees the UI through the `RunContext`, `Destination` and
// `MediaStore` traits. These fakes model a reactive script runtime closely
// enough to exercise replay end to end:
//
// - `FakeSession`: state that survives reruns (widget values, media)
// - `FakeRun`: one execution of the script. Every run gets fresh destination
//   objects with fresh ids, its own emission log and its own
//   `MessageReplayContext`
// - `FakeDestination`: a node of the UI tree. Writes to the main root are
//   redirected into the innermost active block, like `with container:`
//
// Destinations record every emission into the run's replay context the way a
// real UI layer does, so the output of replayed cache hits is recorded by any
// cached function that encloses them.
//
// Emissions are logged by tree path ("main", "main/0", "main/0/1") instead of
// id, so logs of two runs can be compared directly.

#![allow(dead_code)]

use memo_replay::replay::WidgetMsgMetadata;
use memo_replay::{
    CacheError, Destination, DestinationRef, MediaStore, MessageReplayContext, Payload,
    RunContext,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// One message as the user would see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub path: String,
    pub kind: String,
    pub payload: String,
}

/// State shared by every run of one browser session
pub struct FakeSession {
    id: String,
    widgets: Mutex<HashMap<String, Value>>,
    media: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl FakeSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            widgets: Mutex::new(HashMap::new()),
            media: Mutex::new(HashMap::new()),
        })
    }

    /// Start a new script run
    pub fn run(self: &Arc<Self>) -> FakeRun {
        let shared = Arc::new(RunShared {
            session: self.clone(),
            log: Mutex::new(Vec::new()),
            active_blocks: Mutex::new(Vec::new()),
            replay: MessageReplayContext::new(),
            spinners: Mutex::new(Vec::new()),
            registered_widgets: Mutex::new(Vec::new()),
        });
        FakeRun {
            main: FakeDestination::root("main", true, &shared),
            sidebar: FakeDestination::root("sidebar", false, &shared),
            shared,
        }
    }

    /// Simulate the user changing a widget
    pub fn set_widget(&self, widget_id: &str, value: Value) {
        self.widgets.lock().insert(widget_id.to_string(), value);
    }

    pub fn widget(&self, widget_id: &str) -> Option<Value> {
        self.widgets.lock().get(widget_id).cloned()
    }

    pub fn has_media(&self, media_id: &str) -> bool {
        self.media.lock().contains_key(media_id)
    }

    pub fn clear_media(&self) {
        self.media.lock().clear();
    }

    fn widget_or_insert(&self, widget_id: &str, default: Value) -> Value {
        self.widgets
            .lock()
            .entry(widget_id.to_string())
            .or_insert(default)
            .clone()
    }
}

impl MediaStore for FakeSession {
    fn register(&self, data: &[u8], mimetype: &str, media_id: &str) {
        self.media
            .lock()
            .insert(media_id.to_string(), (data.to_vec(), mimetype.to_string()));
    }
}

struct RunShared {
    session: Arc<FakeSession>,
    log: Mutex<Vec<Emission>>,
    active_blocks: Mutex<Vec<Arc<FakeDestination>>>,
    replay: MessageReplayContext,
    spinners: Mutex<Vec<String>>,
    registered_widgets: Mutex<Vec<String>>,
}

/// One execution of the script
pub struct FakeRun {
    shared: Arc<RunShared>,
    main: Arc<FakeDestination>,
    sidebar: Arc<FakeDestination>,
}

impl FakeRun {
    pub fn main_dg(&self) -> Arc<FakeDestination> {
        self.main.clone()
    }

    pub fn sidebar_dg(&self) -> Arc<FakeDestination> {
        self.sidebar.clone()
    }

    pub fn session(&self) -> &Arc<FakeSession> {
        &self.shared.session
    }

    /// Run `f` with implicit writes to the main area redirected into `block`
    pub fn with_block<R>(&self, block: &Arc<FakeDestination>, f: impl FnOnce() -> R) -> R {
        self.shared.active_blocks.lock().push(block.clone());
        let result = f();
        self.shared.active_blocks.lock().pop();
        result
    }

    pub fn emissions(&self) -> Vec<Emission> {
        self.shared.log.lock().clone()
    }

    pub fn spinners(&self) -> Vec<String> {
        self.shared.spinners.lock().clone()
    }

    pub fn registered_widgets(&self) -> Vec<String> {
        self.shared.registered_widgets.lock().clone()
    }

    pub fn ctx(&self) -> Option<&dyn RunContext> {
        Some(self)
    }
}

impl RunContext for FakeRun {
    fn session_id(&self) -> &str {
        &self.shared.session.id
    }

    fn main(&self) -> DestinationRef {
        self.main.clone()
    }

    fn sidebar(&self) -> DestinationRef {
        self.sidebar.clone()
    }

    fn widget_value(&self, widget_id: &str) -> Option<Value> {
        self.shared.session.widget(widget_id)
    }

    fn register_widget(&self, metadata: &WidgetMsgMetadata) {
        self.shared
            .session
            .widget_or_insert(&metadata.widget_id, metadata.value());
        self.shared
            .registered_widgets
            .lock()
            .push(metadata.widget_id.clone());
    }

    fn media_store(&self) -> &dyn MediaStore {
        self.shared.session.as_ref()
    }

    fn replay_context(&self) -> &MessageReplayContext {
        &self.shared.replay
    }

    fn begin_spinner(&self, message: &str) {
        self.shared.spinners.lock().push(message.to_string());
    }
}

/// A node of the UI tree
pub struct FakeDestination {
    id: String,
    path: String,
    is_main_root: bool,
    children: AtomicUsize,
    shared: Arc<RunShared>,
}

impl FakeDestination {
    fn root(path: &str, is_main_root: bool, shared: &Arc<RunShared>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            path: path.to_string(),
            is_main_root,
            children: AtomicUsize::new(0),
            shared: shared.clone(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn text(&self, body: &str) {
        self.enqueue("text", &Payload::from(body));
    }

    pub fn container(&self) -> Arc<FakeDestination> {
        self.open_child(&Payload::from("container"))
    }

    /// Show an image; its bytes are served from the session media store
    pub fn image(&self, bytes: &[u8], mimetype: &str) -> String {
        let media_id = format!("media-{}", hex::encode(bytes));
        self.shared.session.register(bytes, mimetype, &media_id);
        self.shared.replay.save_media_data(bytes, mimetype, &media_id);
        self.enqueue("image", &Payload::from(media_id.as_str()));
        media_id
    }

    /// A radio widget returning the selected index
    pub fn radio(&self, label: &str, options: &[&str], default_index: usize) -> Result<usize, CacheError> {
        self.shared.replay.check_widget_allowed("radio")?;

        let widget_id = format!("radio-{}", label);
        let value = self
            .shared
            .session
            .widget_or_insert(&widget_id, json!(default_index));
        self.shared
            .replay
            .save_widget_metadata(WidgetMsgMetadata::new(&widget_id, &value));
        self.enqueue(
            "radio",
            &Payload::from(format!("{}:{}", label, options.join("|")).as_str()),
        );

        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    /// Innermost active block when this is the main root
    fn redirect(&self) -> Option<Arc<FakeDestination>> {
        if self.is_main_root {
            self.shared.active_blocks.lock().last().cloned()
        } else {
            None
        }
    }

    fn log(&self, kind: &str, payload: &Payload) {
        self.shared.log.lock().push(Emission {
            path: self.path.clone(),
            kind: kind.to_string(),
            payload: String::from_utf8_lossy(payload.as_bytes()).into_owned(),
        });
    }

    fn open_child(&self, payload: &Payload) -> Arc<FakeDestination> {
        let redirected = self.redirect();
        let used: &FakeDestination = redirected.as_deref().unwrap_or(self);
        used.log("block", payload);

        let index = used.children.fetch_add(1, Ordering::SeqCst);
        let child = Arc::new(FakeDestination {
            id: Uuid::new_v4().to_string(),
            path: format!("{}/{}", used.path, index),
            is_main_root: false,
            children: AtomicUsize::new(0),
            shared: self.shared.clone(),
        });

        self.shared
            .replay
            .save_block_message(payload, &self.id, &used.id, &child.id);
        child
    }
}

impl Destination for FakeDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn enqueue(&self, delta_type: &str, payload: &Payload) -> Option<DestinationRef> {
        let redirected = self.redirect();
        let used: &FakeDestination = redirected.as_deref().unwrap_or(self);
        used.log(delta_type, payload);

        let produced_id = Uuid::new_v4().to_string();
        self.shared
            .replay
            .save_element_message(delta_type, payload, &self.id, &used.id, &produced_id);
        None
    }

    fn open_block(&self, payload: &Payload) -> DestinationRef {
        self.open_child(payload)
    }
}

/// Counts executions of a cached body
#[derive(Debug, Default)]
pub struct Counter(AtomicUsize);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shorthand for building an emission in assertions
pub fn emission(path: &str, kind: &str, payload: &str) -> Emission {
    Emission {
        path: path.to_string(),
        kind: kind.to_string(),
        payload: payload.to_string(),
    }
}
