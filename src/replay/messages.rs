use crate::runtime::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media bytes an element referenced when it was recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMsgData {
    pub data: Vec<u8>,
    pub mimetype: String,
    pub media_id: String,
}

/// Registration of the widget an element created
///
/// The value is kept as JSON text so the record stays self-describing in
/// binary encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetMsgMetadata {
    pub widget_id: String,
    value_json: String,
}

impl WidgetMsgMetadata {
    pub fn new(widget_id: impl Into<String>, value: &Value) -> Self {
        Self {
            widget_id: widget_id.into(),
            value_json: value.to_string(),
        }
    }

    /// Value the widget had when the element was recorded
    pub fn value(&self) -> Value {
        serde_json::from_str(&self.value_json).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMsgData {
    pub delta_type: String,
    pub payload: Payload,
    /// Destination the element is replayed onto
    pub invoked_on_id: String,
    /// Destination that received the element when it was recorded
    pub used_on_id: String,
    /// Destination returned by the element, if it was written into later
    pub produced_id: String,
    pub media: Vec<MediaMsgData>,
    pub widget: Option<WidgetMsgMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMsgData {
    pub payload: Payload,
    pub invoked_on_id: String,
    pub used_on_id: String,
    /// Id of the block itself
    pub produced_id: String,
}

/// One recorded UI emission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgData {
    Element(ElementMsgData),
    Block(BlockMsgData),
}

impl MsgData {
    pub fn invoked_on_id(&self) -> &str {
        match self {
            MsgData::Element(element) => &element.invoked_on_id,
            MsgData::Block(block) => &block.invoked_on_id,
        }
    }

    pub fn produced_id(&self) -> &str {
        match self {
            MsgData::Element(element) => &element.produced_id,
            MsgData::Block(block) => &block.produced_id,
        }
    }

    pub fn widget(&self) -> Option<&WidgetMsgMetadata> {
        match self {
            MsgData::Element(element) => element.widget.as_ref(),
            MsgData::Block(_) => None,
        }
    }
}

/// A cached return value with the messages its function emitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult<V> {
    pub value: V,
    pub messages: Vec<MsgData>,
    /// Id of the main area root when the value was computed
    pub main_id: String,
    /// Id of the sidebar root when the value was computed
    pub sidebar_id: String,
}
