// Re-export needed modules for testing
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod store;
pub mod sync; // Caching components and the session client

// Re-export main types for convenience
pub use error::{StoreError, SyncError};
pub use identity::{IdentityProvider, LocalIdentity, SessionContext, SessionSignal};
pub use models::*;
pub use store::{MemoryStore, RemoteStore, SharedStore, SqliteStore};
pub use sync::{ChatClient, SyncNotice, SyncOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn message(sender: Uuid, at: chrono::DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: sender,
            content: "hello".to_string(),
            message_type: MessageKind::Text,
            reply_to: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn status(message: &Message, user: Uuid, value: DeliveryStatus) -> MessageStatus {
        MessageStatus {
            id: Uuid::new_v4(),
            message_id: message.id,
            user_id: user,
            status: value,
            created_at: message.created_at,
            updated_at: message.created_at,
        }
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let late = early + Duration::microseconds(1);
        let (a, b) = (ts::format(&early), ts::format(&late));

        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(ts::parse(&b), Some(late));
    }

    #[test]
    fn test_delivery_status_order() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
        assert_eq!(DeliveryStatus::Read.lower_stored(), vec![DeliveryStatus::Delivered]);
        assert!(DeliveryStatus::Delivered.lower_stored().is_empty());
    }

    #[test]
    fn test_aggregate_status_for_sender_only() {
        let (me, bob, dee) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let sent = message(me, Utc::now());
        let mut details = MessageWithDetails::bare(sent.clone());

        assert_eq!(details.aggregate_status(me), Some(DeliveryStatus::Sent));
        assert_eq!(details.aggregate_status(bob), None);

        details.statuses.push(status(&sent, bob, DeliveryStatus::Delivered));
        details.statuses.push(status(&sent, dee, DeliveryStatus::Read));
        assert_eq!(details.aggregate_status(me), Some(DeliveryStatus::Read));
        assert_eq!(details.status_for(bob), DeliveryStatus::Delivered);
        assert_eq!(details.status_for(me), DeliveryStatus::Sent);
    }

    #[test]
    fn test_offer_last_message_keeps_newest() {
        let now = Utc::now();
        let me = Uuid::new_v4();
        let mut summary = ConversationSummary {
            conversation: Conversation {
                id: Uuid::new_v4(),
                name: None,
                is_group: false,
                created_by: me,
                created_at: now,
                updated_at: now,
            },
            participants: Vec::new(),
            last_message: None,
        };

        let newer = MessageWithDetails::bare(message(me, now + Duration::seconds(5)));
        let older = MessageWithDetails::bare(message(me, now + Duration::seconds(1)));

        assert!(summary.offer_last_message(newer.clone()));
        assert!(!summary.offer_last_message(older));
        assert_eq!(summary.last_message.as_ref().map(|m| m.id()), Some(newer.id()));
        assert_eq!(summary.activity_key(), newer.ordering_key());
    }

    #[test]
    fn test_stale_online_flag_reads_offline() {
        let now = Utc::now();
        let mut profile = Profile {
            id: Uuid::new_v4(),
            username: "ann".to_string(),
            display_name: "Ann".to_string(),
            avatar_url: None,
            status: None,
            is_online: true,
            last_seen: Some(now - Duration::minutes(10)),
            created_at: now,
            updated_at: now,
        };
        assert!(!profile.is_effectively_online(now, Duration::minutes(5)));

        profile.last_seen = Some(now - Duration::minutes(1));
        assert!(profile.is_effectively_online(now, Duration::minutes(5)));

        profile.is_online = false;
        assert!(!profile.is_effectively_online(now, Duration::minutes(5)));
    }

    #[test]
    fn test_profile_uses_store_column_names() {
        let value = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "username": "ann",
            "full_name": "Ann Example",
            "is_online": false,
            "last_seen": null,
            "created_at": "2024-01-01T09:00:00.000000Z",
            "updated_at": "2024-01-01T09:00:00.000000Z"
        });
        let profile: Profile = serde_json::from_value(value).unwrap();
        assert_eq!(profile.display_name, "Ann Example");
        assert_eq!(profile.avatar_url, None);

        let update = ProfileUpdate {
            display_name: Some("Ann E.".to_string()),
            ..ProfileUpdate::default()
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), serde_json::json!({"full_name": "Ann E."}));
    }
}
