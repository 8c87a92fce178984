//! Which session a `terminal-connect` lands on.
//!
//! In order: the session id the client asked for (live, else restored from
//! the store); the most recently active live session for the device, closing
//! any duplicates; the newest resumable stored session for the device; and
//! finally a brand new session.

use crate::device::DeviceRecord;
use crate::session::{ClientHandle, SessionRegistry};
use std::sync::Arc;
use termgate_core::GateResult;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub session_id: String,
    pub is_resumed: bool,
    pub session_name: Option<String>,
}

pub async fn resolve_session(
    registry: &Arc<SessionRegistry>,
    device: &DeviceRecord,
    requested_id: Option<&str>,
    requested_name: Option<String>,
    client: ClientHandle,
) -> GateResult<Resolution> {
    let resumed = |id: &str, name: Option<String>| Resolution {
        session_id: id.to_string(),
        is_resumed: true,
        session_name: name.or_else(|| requested_name.clone()),
    };

    if let Some(id) = requested_id {
        match registry.session(id).await {
            Some(session) if session.device_id == device.id => {
                if registry.attach_client(id, client.clone()).await {
                    return Ok(resumed(id, session.name.clone()));
                }
            }
            Some(_) => {}
            None => {
                let stored = registry.stored_candidates(&device.id).await;
                if let Some(record) = stored.into_iter().find(|r| r.id == id) {
                    if registry.restore_from_store(id, client.clone()).await? {
                        return Ok(resumed(id, record.name));
                    }
                }
            }
        }
    }

    let live = registry.resumable_for_device(&device.id).await;
    if let Some((newest, duplicates)) = live.split_first() {
        if registry.attach_client(&newest.id, client.clone()).await {
            for dup in duplicates {
                registry
                    .destroy_session(&dup.id, "superseded by a newer session for this device")
                    .await;
            }
            if !duplicates.is_empty() {
                info!(device_id = %device.id, closed = duplicates.len(), "closed duplicate sessions");
            }
            return Ok(resumed(&newest.id, newest.name.clone()));
        }
    }

    if let Some(record) = registry.stored_candidates(&device.id).await.into_iter().next() {
        if registry.restore_from_store(&record.id, client.clone()).await? {
            return Ok(resumed(&record.id, record.name));
        }
    }

    let id = generate_session_id();
    registry
        .create_session(&id, &device.id, requested_name.clone(), &device.credentials, client)
        .await?;
    Ok(Resolution {
        session_id: id,
        is_resumed: false,
        session_name: requested_name,
    })
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::AuthMethod;
    use crate::store::{SessionRecord, SessionStatus, SessionStore};
    use crate::testing::{client, fixture, next_msg};
    use termgate_core::ServerMessage;

    fn device(f: &crate::testing::Fixture) -> DeviceRecord {
        use crate::device::DeviceDirectory;
        f.devices.device("fw-1").unwrap()
    }

    #[tokio::test]
    async fn back_to_back_connects_reuse_one_session() {
        let f = fixture();
        let dev = device(&f);
        let (c1, _rx1) = client(1);
        let first = resolve_session(&f.registry, &dev, None, None, c1).await.unwrap();
        assert!(!first.is_resumed);

        let (c2, _rx2) = client(2);
        let second = resolve_session(&f.registry, &dev, None, None, c2).await.unwrap();
        assert!(second.is_resumed);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(f.registry.count().await, 1);
    }

    #[tokio::test]
    async fn duplicates_are_closed_keeping_the_newest() {
        let f = fixture();
        let dev = device(&f);
        let (c1, _rx1) = client(1);
        let (c2, mut rx2) = client(2);
        f.registry
            .create_session("older", "fw-1", None, &dev.credentials, c1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.registry
            .create_session("newer", "fw-1", None, &dev.credentials, c2.clone())
            .await
            .unwrap();
        assert!(matches!(next_msg(&mut rx2).await, ServerMessage::Connect { .. }));

        let (c3, _rx3) = client(3);
        let r = resolve_session(&f.registry, &dev, None, None, c3).await.unwrap();
        assert_eq!(r.session_id, "newer");
        assert_eq!(f.registry.count().await, 1);
        // the previous holder of the survivor is told it lost it
        assert!(matches!(next_msg(&mut rx2).await, ServerMessage::Close { .. }));
    }

    #[tokio::test]
    async fn requested_id_wins_over_newest() {
        let f = fixture();
        let dev = device(&f);
        let (c1, _rx1) = client(1);
        let (c2, _rx2) = client(2);
        f.registry
            .create_session("a", "fw-1", Some("mine".into()), &dev.credentials, c1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.registry
            .create_session("b", "fw-1", None, &dev.credentials, c2)
            .await
            .unwrap();

        let (c3, _rx3) = client(3);
        let r = resolve_session(&f.registry, &dev, Some("a"), None, c3).await.unwrap();
        assert_eq!(r.session_id, "a");
        assert_eq!(r.session_name.as_deref(), Some("mine"));
        assert!(r.is_resumed);
    }

    #[tokio::test]
    async fn stored_session_is_restored_before_creating() {
        let f = fixture();
        let dev = device(&f);
        let mut record = SessionRecord::new("kept", "fw-1", None, AuthMethod::Password);
        record.status = SessionStatus::Disconnected;
        f.store.create_session_record(&record).await.unwrap();

        let (c, _rx) = client(1);
        let r = resolve_session(&f.registry, &dev, None, None, c).await.unwrap();
        assert_eq!(r.session_id, "kept");
        assert!(r.is_resumed);
    }

    #[tokio::test]
    async fn unknown_requested_id_falls_through_to_create() {
        let f = fixture();
        let dev = device(&f);
        let (c, _rx) = client(1);
        let r = resolve_session(&f.registry, &dev, Some("ghost"), Some("lab".into()), c)
            .await
            .unwrap();
        assert!(!r.is_resumed);
        assert_ne!(r.session_id, "ghost");
        assert_eq!(r.session_name.as_deref(), Some("lab"));
    }

    #[test]
    fn session_ids_are_32_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_session_id());
    }
}
