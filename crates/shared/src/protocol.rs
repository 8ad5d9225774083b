use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AttachmentKind, CallId, FileId, GroupId, MessageId, UserId},
    error::ApiError,
};

/// Attachment metadata carried on a message. The blob itself lives in the
/// file store and is fetched over HTTP via `url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub kind: AttachmentKind,
    pub storage_key: FileId,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub from_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_group_id: Option<GroupId>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub timestamp: DateTime<Utc>,
    pub edited: bool,
    pub call_ended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    pub creator_id: UserId,
    pub members: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Frames a client may send over the realtime socket.
///
/// WebRTC negotiation payloads are opaque to the server; they are held as raw
/// JSON and relayed verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    SendMessage {
        #[serde(default)]
        to_user_id: Option<UserId>,
        #[serde(default)]
        to_group_id: Option<GroupId>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        attachment: Option<AttachmentPayload>,
        #[serde(default)]
        call_id: Option<CallId>,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    JoinCall {
        call_id: CallId,
    },
    Offer {
        call_id: CallId,
        payload: serde_json::Value,
    },
    Answer {
        call_id: CallId,
        payload: serde_json::Value,
    },
    IceCandidate {
        call_id: CallId,
        payload: serde_json::Value,
    },
    AddParticipant {
        call_id: CallId,
        username: String,
    },
    EndCall {
        call_id: CallId,
    },
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    LoadMessages {
        messages: Vec<MessagePayload>,
    },
    Message {
        message: MessagePayload,
    },
    MessageEdited {
        message: MessagePayload,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    CallJoined {
        initiator_id: UserId,
    },
    Offer {
        payload: serde_json::Value,
    },
    Answer {
        payload: serde_json::Value,
    },
    IceCandidate {
        payload: serde_json::Value,
    },
    IncomingCall {
        call_id: CallId,
        from_user_id: UserId,
        call_link: String,
    },
    ParticipantAdded {
        username: String,
    },
    ParticipantNotFound {
        username: String,
    },
    CallEnded {},
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_camel_case_tags() {
        let frame: ClientEvent = serde_json::from_str(
            r#"{"type":"sendMessage","payload":{"toUserId":"u2","content":"hi"}}"#,
        )
        .expect("frame");
        let ClientEvent::SendMessage {
            to_user_id,
            to_group_id,
            content,
            ..
        } = frame
        else {
            panic!("expected sendMessage");
        };
        assert_eq!(to_user_id, Some(UserId("u2".into())));
        assert_eq!(to_group_id, None);
        assert_eq!(content, "hi");
    }

    #[test]
    fn signaling_payload_survives_relay_untouched() {
        let frame: ClientEvent = serde_json::from_str(
            r#"{"type":"iceCandidate","payload":{"callId":"c1","payload":{"candidate":"udp 1"}}}"#,
        )
        .expect("frame");
        let ClientEvent::IceCandidate { call_id, payload } = frame else {
            panic!("expected iceCandidate");
        };
        assert_eq!(call_id, CallId("c1".into()));

        let out = serde_json::to_string(&ServerEvent::IceCandidate { payload }).expect("out");
        assert_eq!(
            out,
            r#"{"type":"iceCandidate","payload":{"payload":{"candidate":"udp 1"}}}"#
        );
    }

    #[test]
    fn call_ended_serializes_with_empty_payload() {
        let out = serde_json::to_string(&ServerEvent::CallEnded {}).expect("out");
        assert_eq!(out, r#"{"type":"callEnded","payload":{}}"#);
    }

    #[test]
    fn message_payload_omits_absent_destinations() {
        let message = MessagePayload {
            id: MessageId("m1".into()),
            from_user_id: UserId("u1".into()),
            to_user_id: None,
            to_group_id: None,
            content: "note to self".into(),
            attachment: None,
            call_id: None,
            timestamp: Utc::now(),
            edited: false,
            call_ended: false,
        };
        let out = serde_json::to_string(&message).expect("out");
        assert!(!out.contains("toUserId"));
        assert!(!out.contains("toGroupId"));
        assert!(out.contains("fromUserId"));
    }
}
