//! Wire format of the real-time channel.
//!
//! Outbound envelopes are `{"type":"broadcast","event":{..}}` and
//! `{"type":"update-presence","presence":{..}}`. The relay forwards broadcast
//! events verbatim, turns presence updates into `presence` messages and
//! announces departures with `presence-leave`.

use std::time::{SystemTime, UNIX_EPOCH};

use kurbo::Point;
use serde::{Deserialize, Serialize};

use crate::canvas::CanvasSettings;
use crate::image::{CanvasImage, ImageId};
use crate::strokes::{SerializableColor, Stroke, StrokeId};
use crate::viewport::{from_matrix4, to_matrix4};

/// Milliseconds since the Unix epoch, used to timestamp outbound events.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Messages sent to the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Broadcast { event: BroadcastEvent },
    UpdatePresence { presence: Presence },
}

/// Messages received from the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Broadcast { event: BroadcastEvent },
    Presence { presence: Presence },
    PresenceLeave {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Error { message: String },
}

/// One broadcast event with its attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    /// Unique per event; receivers use it to drop redundant deliveries.
    pub event_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_color: Option<SerializableColor>,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl BroadcastEvent {
    pub fn new(user_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            user_name: None,
            user_color: None,
            timestamp: unix_millis(),
            payload,
        }
    }

    pub fn with_attribution(mut self, name: impl Into<String>, color: SerializableColor) -> Self {
        self.user_name = Some(name.into());
        self.user_color = Some(color);
        self
    }
}

/// The state change an event carries, dispatched on `event.type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    /// One or more strokes batched over the debounce window.
    StrokeAdd { strokes: Vec<Stroke> },
    CanvasClear,
    ImageAdd { image: ImageDescriptor },
    /// Full transform replacement; the last one received wins.
    ImageUpdate {
        id: ImageId,
        #[serde(rename = "transformMatrix")]
        transform_matrix: [f64; 16],
    },
    ImageDelete { id: ImageId },
    CanvasSettings { settings: CanvasSettings },
    StrokeUndo {
        #[serde(rename = "strokeId")]
        stroke_id: StrokeId,
    },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::StrokeAdd { .. } => "stroke-add",
            EventPayload::CanvasClear => "canvas-clear",
            EventPayload::ImageAdd { .. } => "image-add",
            EventPayload::ImageUpdate { .. } => "image-update",
            EventPayload::ImageDelete { .. } => "image-delete",
            EventPayload::CanvasSettings { .. } => "canvas-settings",
            EventPayload::StrokeUndo { .. } => "stroke-undo",
        }
    }
}

/// Compact description of an image whose bytes live in blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    pub id: ImageId,
    pub url: String,
    /// Column-major 4×4 matrix.
    pub transform_matrix: [f64; 16],
    pub width: u32,
    pub height: u32,
}

impl ImageDescriptor {
    pub fn from_image(image: &CanvasImage, url: impl Into<String>) -> Self {
        Self {
            id: image.id().clone(),
            url: url.into(),
            transform_matrix: to_matrix4(image.transform()),
            width: image.bitmap().width(),
            height: image.bitmap().height(),
        }
    }

    pub fn transform(&self) -> kurbo::Affine {
        from_matrix4(&self.transform_matrix)
    }
}

/// Cumulative presence state. Each update carries everything, so a lost
/// message is repaired by the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: String,
    pub user_name: String,
    pub color: SerializableColor,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub is_drawing: bool,
}

impl Presence {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        color: SerializableColor,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            color,
            role: role.into(),
            cursor: None,
            tool: None,
            is_drawing: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Bitmap;
    use crate::strokes::StrokeKind;
    use kurbo::Affine;

    #[test]
    fn test_broadcast_envelope_shape() {
        let stroke = Stroke::new(StrokeKind::Line, SerializableColor::black(), 2.0, 1.0)
            .with_id("s1")
            .with_points(vec![Point::new(0.0, 0.0), Point::new(3.0, 4.0)]);
        let event = BroadcastEvent::new("alice", EventPayload::StrokeAdd { strokes: vec![stroke] })
            .with_attribution("Alice", SerializableColor::new(255, 0, 0, 255));
        let json = serde_json::to_value(ClientMessage::Broadcast { event }).unwrap();

        assert_eq!(json["type"], "broadcast");
        assert_eq!(json["event"]["type"], "stroke-add");
        assert_eq!(json["event"]["userId"], "alice");
        assert_eq!(json["event"]["userName"], "Alice");
        assert_eq!(json["event"]["userColor"], "#ff0000ff");
        assert_eq!(json["event"]["strokes"][0]["type"], "line");
        assert!(json["event"]["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_parse_inbound_messages() {
        let json = r#"{"type":"broadcast","event":{"type":"image-update","id":"img",
            "transformMatrix":[1,0,0,0, 0,1,0,0, 0,0,1,0, 5,6,0,1],
            "eventId":"e1","userId":"bob","timestamp":7}}"#;
        let ServerMessage::Broadcast { event } = serde_json::from_str(json).unwrap() else {
            panic!("expected broadcast");
        };
        assert_eq!(event.user_id, "bob");
        let EventPayload::ImageUpdate { transform_matrix, .. } = event.payload else {
            panic!("expected image-update");
        };
        assert_eq!(from_matrix4(&transform_matrix), Affine::translate((5.0, 6.0)));

        let leave: ServerMessage =
            serde_json::from_str(r#"{"type":"presence-leave","userId":"bob"}"#).unwrap();
        assert_eq!(leave, ServerMessage::PresenceLeave { user_id: "bob".into() });

        let clear: ServerMessage = serde_json::from_str(
            r#"{"type":"broadcast","event":{"type":"canvas-clear","eventId":"e2","userId":"c","timestamp":1}}"#,
        )
        .unwrap();
        assert!(matches!(
            clear,
            ServerMessage::Broadcast { event } if event.payload == EventPayload::CanvasClear
        ));
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let json = r#"{"type":"broadcast","event":{"type":"teleport","eventId":"e","userId":"u","timestamp":1}}"#;
        assert!(serde_json::from_str::<ServerMessage>(json).is_err());
    }

    #[test]
    fn test_presence_update_shape() {
        let mut presence = Presence::new("u1", "Una", SerializableColor::black(), "editor");
        presence.cursor = Some(Point::new(10.0, 20.0));
        let json = serde_json::to_value(ClientMessage::UpdatePresence { presence }).unwrap();
        assert_eq!(json["type"], "update-presence");
        assert_eq!(json["presence"]["userName"], "Una");
        assert_eq!(json["presence"]["cursor"]["x"], 10.0);
        assert_eq!(json["presence"]["isDrawing"], false);
    }

    #[test]
    fn test_descriptor_from_image() {
        let image = CanvasImage::new("i", Bitmap::solid(4, 3, [0, 0, 0, 255]).unwrap())
            .with_transform(Affine::translate((2.0, 1.0)))
            .unwrap();
        let descriptor = ImageDescriptor::from_image(&image, "https://blobs/i.png");
        assert_eq!((descriptor.width, descriptor.height), (4, 3));
        assert_eq!(descriptor.transform(), image.transform());
    }
}
