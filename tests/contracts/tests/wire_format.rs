//! Pins the socket and REST wire shapes against recorded backend
//! traffic. A failure here means the server contract drifted.

use athelo_chat_client::rest::conversations_query;
use athelo_chat_protocol::socket::{IncomingSocketMessage, OutgoingSocketMessage};
use athelo_chat_protocol::ChatRoomId;
use serde_json::{json, Value};

fn encode(message: OutgoingSocketMessage) -> Value {
    serde_json::from_str(&message.encode().unwrap()).unwrap()
}

#[test]
fn every_outgoing_request_carries_the_screaming_snake_tag() {
    let room = ChatRoomId::new("room1");
    let cases = vec![
        (
            OutgoingSocketMessage::GetHistory {
                chat_room_identifier: room.clone(),
                timestamp: 1_700_000_000_000_000,
                limit: 1,
            },
            "GET_HISTORY",
        ),
        (
            OutgoingSocketMessage::GetLastChatRoomMessage {
                chat_room_identifier: room.clone(),
            },
            "GET_LAST_CHAT_ROOM_MESSAGE",
        ),
        (
            OutgoingSocketMessage::SetLastMessageRead {
                chat_room_identifier: room.clone(),
                message_id: 1_700_000_000_000_001,
            },
            "SET_LAST_MESSAGE_READ",
        ),
        (
            OutgoingSocketMessage::GetUnreadMessagesCount {
                chat_room_identifier: room.clone(),
            },
            "GET_UNREAD_MESSAGES_COUNT",
        ),
    ];
    for (message, tag) in cases {
        let value = encode(message);
        assert_eq!(value["type"], tag);
        assert_eq!(value["chat_room_identifier"], "room1");
    }
}

#[test]
fn set_last_message_read_carries_the_message_id() {
    let value = encode(OutgoingSocketMessage::SetLastMessageRead {
        chat_room_identifier: ChatRoomId::new("room1"),
        message_id: 1_700_000_000_000_001,
    });
    assert_eq!(value["message_id"], 1_700_000_000_000_001_i64);
}

#[test]
fn recorded_history_frame_decodes_with_mixed_timestamp_encodings() {
    // Verbatim capture: the backend interleaves integer and
    // numeric-string message ids within one page.
    let raw = json!({
        "type": "GET_HISTORY",
        "chat_room_identifier": "room1",
        "payload": [
            {"chat_room_identifier": "room1", "message_id": 1_700_000_000_000_001_i64, "text": "first", "user_id": 7},
            {"chat_room_identifier": "room1", "message_id": "1700000000000002", "text": "second", "user_id": 9}
        ]
    });
    let decoded = IncomingSocketMessage::decode(&raw.to_string()).unwrap();
    let IncomingSocketMessage::History { messages, .. } = decoded else {
        panic!("expected a history frame");
    };
    assert_eq!(messages[0].message_id, 1_700_000_000_000_001);
    assert_eq!(messages[1].message_id, 1_700_000_000_000_002);
}

#[test]
fn history_request_and_response_share_the_tag() {
    let request = encode(OutgoingSocketMessage::GetHistory {
        chat_room_identifier: ChatRoomId::new("room1"),
        timestamp: 1_700_000_000_000_000,
        limit: 1,
    });
    let response = json!({
        "type": request["type"],
        "chat_room_identifier": "room1",
        "payload": [
            {"chat_room_identifier": "room1", "message_id": 1_699_999_999_000_000_i64, "text": "latest"}
        ]
    });
    let decoded = IncomingSocketMessage::decode(&response.to_string()).unwrap();
    assert!(matches!(decoded, IncomingSocketMessage::History { .. }));
}

#[test]
fn error_frames_keep_the_exception_nesting() {
    let raw = r#"{"type": "ERROR", "exception": {"code": 4001, "detail": "session expired"}}"#;
    let IncomingSocketMessage::Error { exception } =
        IncomingSocketMessage::decode(raw).unwrap()
    else {
        panic!("expected an error frame");
    };
    assert_eq!(exception["code"], 4001);
    assert_eq!(exception["detail"], "session expired");
}

#[test]
fn routable_and_system_routable_differ_in_payload_scope() {
    let routable = r#"{"type": "ROUTABLE", "payload": {"route": "/news/3"}}"#;
    let IncomingSocketMessage::Routable { payload } =
        IncomingSocketMessage::decode(routable).unwrap()
    else {
        panic!("expected a routable frame");
    };
    assert_eq!(payload["route"], "/news/3");

    // SYSTEM_ROUTABLE has no payload key; the frame itself is the
    // payload, tag included.
    let system = r#"{"type": "SYSTEM_ROUTABLE", "route": "/appointments/4"}"#;
    let IncomingSocketMessage::SystemRoutable { payload } =
        IncomingSocketMessage::decode(system).unwrap()
    else {
        panic!("expected a system routable frame");
    };
    assert_eq!(payload["route"], "/appointments/4");
    assert_eq!(payload["type"], "SYSTEM_ROUTABLE");
}

#[test]
fn read_receipt_frames_decode() {
    let raw = json!({
        "type": "GET_LAST_MESSAGES_READ",
        "payload": [
            {"chat_room_identifier": "room1", "message_id": "1700000000000005"}
        ]
    });
    let IncomingSocketMessage::MessagesRead { receipts } =
        IncomingSocketMessage::decode(&raw.to_string()).unwrap()
    else {
        panic!("expected a read receipt frame");
    };
    assert_eq!(receipts[0].message_id, 1_700_000_000_000_005);
}

#[test]
fn frames_without_payload_decode_as_empty() {
    let raw = r#"{"type": "GET_UNREAD_MESSAGES_COUNT"}"#;
    let IncomingSocketMessage::UnreadMessages { counts } =
        IncomingSocketMessage::decode(raw).unwrap()
    else {
        panic!("expected an unread count frame");
    };
    assert!(counts.is_empty());
}

#[test]
fn conversation_filters_switch_between_eq_and_in() {
    assert!(conversations_query(&[]).is_empty());

    let one = conversations_query(&[ChatRoomId::new("a")]);
    assert_eq!(one, vec![("chat_room_identifier".to_string(), "a".to_string())]);

    let many = conversations_query(&[ChatRoomId::new("a"), ChatRoomId::new("b")]);
    assert_eq!(
        many,
        vec![("chat_room_identifier__in".to_string(), "a,b".to_string())]
    );
}
