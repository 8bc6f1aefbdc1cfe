//! Data model shared across the notification listener, reconciler, and executor.

use serde::Deserialize;
use std::fmt;

/// Which PeerDB lifecycle notification channel an [`Event`] arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Create,
    Drop,
}

impl Channel {
    pub fn as_notify_channel(&self) -> &'static str {
        match self {
            Channel::Create => "peerdb_create_mirror",
            Channel::Drop => "peerdb_drop_mirror",
        }
    }

    /// Maps a raw `LISTEN` channel name back to a [`Channel`], if recognized.
    pub fn from_notify_channel(name: &str) -> Option<Self> {
        match name {
            "peerdb_create_mirror" => Some(Channel::Create),
            "peerdb_drop_mirror" => Some(Channel::Drop),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_notify_channel())
    }
}

/// Wire payload delivered on either notification channel.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyPayload {
    pub schema: String,
    pub table: String,
}

/// A decoded Postgres notification, enriched with delivery metadata.
#[derive(Debug, Clone)]
pub struct Event {
    pub channel: Channel,
    pub schema: String,
    pub table: String,
    pub origin_pid: i32,
}

impl Event {
    pub fn dedup_key(&self) -> String {
        format!(
            "notification:{}:{}.{}:{}",
            match self.channel {
                Channel::Create => "create",
                Channel::Drop => "drop",
            },
            self.schema,
            self.table,
            self.origin_pid
        )
    }

    pub fn mirror_name(&self) -> String {
        crate::config::Config::mirror_name(&self.table)
    }
}

/// A mirror lifecycle operation derived from an [`Event`], the unit the executor acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRequest {
    pub schema: String,
    pub table: String,
    pub op: MirrorOp,
    pub mirror_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOp {
    Create,
    Drop,
}

impl From<&Event> for MirrorRequest {
    fn from(event: &Event) -> Self {
        MirrorRequest {
            schema: event.schema.clone(),
            table: event.table.clone(),
            op: match event.channel {
                Channel::Create => MirrorOp::Create,
                Channel::Drop => MirrorOp::Drop,
            },
            mirror_name: event.mirror_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_and_distinguishes_channels() {
        let create = Event { channel: Channel::Create, schema: "public".into(), table: "orders".into(), origin_pid: 42 };
        let drop = Event { channel: Channel::Drop, schema: "public".into(), table: "orders".into(), origin_pid: 42 };
        assert_ne!(create.dedup_key(), drop.dedup_key());
        assert_eq!(create.dedup_key(), "notification:create:public.orders:42");
    }

    #[test]
    fn mirror_name_is_table_plus_suffix() {
        let event = Event { channel: Channel::Create, schema: "public".into(), table: "orders".into(), origin_pid: 1 };
        assert_eq!(event.mirror_name(), "orders_mirror");
    }

    #[test]
    fn mirror_request_derives_op_from_channel() {
        let event = Event { channel: Channel::Drop, schema: "public".into(), table: "orders".into(), origin_pid: 1 };
        let req = MirrorRequest::from(&event);
        assert_eq!(req.op, MirrorOp::Drop);
        assert_eq!(req.mirror_name, "orders_mirror");
    }

    #[test]
    fn channel_round_trips_through_notify_names() {
        assert_eq!(Channel::from_notify_channel("peerdb_create_mirror"), Some(Channel::Create));
        assert_eq!(Channel::from_notify_channel("peerdb_drop_mirror"), Some(Channel::Drop));
        assert_eq!(Channel::from_notify_channel("something_else"), None);
    }

    #[test]
    fn notify_payload_deserializes_from_json() {
        let payload: NotifyPayload = serde_json::from_str(r#"{"schema":"public","table":"orders"}"#).unwrap();
        assert_eq!(payload.schema, "public");
        assert_eq!(payload.table, "orders");
    }
}
