//! Messages pushed to a viewer

use serde::Serialize;

use crate::bus::BoardEvent;

/// One event as written to the viewer's stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    /// `new_entry` or `delete_entry`
    pub event: &'static str,
    /// JSON body
    pub data: String,
}

impl PushMessage {
    pub fn from_event(event: &BoardEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.event.name(),
            data: event.event.data()?,
        })
    }

    /// Render as a server-sent events frame
    pub fn to_sse(&self) -> String {
        let mut frame = format!("event: {}\n", self.event);
        for line in self.data.lines() {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BoardId, Entry, EntryId};

    #[test]
    fn test_from_added_event() {
        let entry = Entry::text("hello");
        let msg = PushMessage::from_event(&BoardEvent::entry_added(BoardId::new("b"), entry.view())).unwrap();

        assert_eq!(msg.event, "new_entry");
        let data: serde_json::Value = serde_json::from_str(&msg.data).unwrap();
        assert_eq!(data["id"], entry.id.to_string());
        assert_eq!(data["content"], "hello");
    }

    #[test]
    fn test_sse_frame() {
        let id = EntryId::new();
        let msg = PushMessage::from_event(&BoardEvent::entry_removed(BoardId::new("b"), id)).unwrap();

        assert_eq!(msg.to_sse(), format!("event: delete_entry\ndata: {{\"id\":\"{id}\"}}\n\n"));
    }
}
