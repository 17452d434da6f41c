use std::sync::mpsc::Sender;

/// Receiver for what the primary's listener observes.
pub trait InstanceEvents {
    /// A peer finished a handshake that announces a new instance.
    fn instance_started(&mut self);

    /// A complete data frame arrived from the secondary `instance_id`.
    fn message_received(&mut self, instance_id: u32, payload: Vec<u8>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    Started,
    Message { instance_id: u32, payload: Vec<u8> },
}

impl InstanceEvents for Vec<InstanceEvent> {
    fn instance_started(&mut self) {
        self.push(InstanceEvent::Started);
    }

    fn message_received(&mut self, instance_id: u32, payload: Vec<u8>) {
        self.push(InstanceEvent::Message {
            instance_id,
            payload,
        });
    }
}

// Nobody listening is not the listener's problem.
impl InstanceEvents for Sender<InstanceEvent> {
    fn instance_started(&mut self) {
        let _ = self.send(InstanceEvent::Started);
    }

    fn message_received(&mut self, instance_id: u32, payload: Vec<u8>) {
        let _ = self.send(InstanceEvent::Message {
            instance_id,
            payload,
        });
    }
}
