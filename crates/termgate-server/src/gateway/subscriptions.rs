//! Per-connection device status subscriptions.

use crate::session::ClientHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use termgate_core::{DeviceStatus, ServerMessage};
use tracing::debug;

/// device id -> (conn id -> client)
#[derive(Debug, Default)]
pub struct DeviceSubscriptions {
    inner: Mutex<HashMap<String, HashMap<u64, ClientHandle>>>,
}

impl DeviceSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, device_id: &str, client: ClientHandle) {
        self.inner
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .insert(client.conn_id, client);
    }

    pub fn unsubscribe(&self, device_id: &str, conn_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.get_mut(device_id) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                inner.remove(device_id);
            }
        }
    }

    /// Forget every subscription held by a connection.
    pub fn remove_connection(&self, conn_id: u64) {
        let mut inner = self.inner.lock();
        inner.retain(|_, subs| {
            subs.remove(&conn_id);
            !subs.is_empty()
        });
    }

    /// Send a status update to every subscriber of `device_id`. Closed
    /// connections are dropped. Returns how many were reached.
    pub fn publish(&self, device_id: &str, status: DeviceStatus) -> usize {
        let mut inner = self.inner.lock();
        let Some(subs) = inner.get_mut(device_id) else {
            return 0;
        };
        let msg = ServerMessage::DeviceStatus {
            device_id: device_id.to_string(),
            status,
        };
        subs.retain(|_, client| client.send(msg.clone()));
        let reached = subs.len();
        if subs.is_empty() {
            inner.remove(device_id);
        }
        debug!(device_id, status = status.as_str(), reached, "device status published");
        reached
    }

    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.inner.lock().get(device_id).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::client;

    #[test]
    fn publish_reaches_only_subscribers() {
        let subs = DeviceSubscriptions::new();
        let (a, mut a_rx) = client(1);
        let (b, mut b_rx) = client(2);
        subs.subscribe("fw-1", a);
        subs.subscribe("fw-2", b);

        assert_eq!(subs.publish("fw-1", DeviceStatus::Offline), 1);
        assert_eq!(
            a_rx.try_recv().unwrap(),
            ServerMessage::DeviceStatus {
                device_id: "fw-1".into(),
                status: DeviceStatus::Offline
            }
        );
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_and_connection_removal() {
        let subs = DeviceSubscriptions::new();
        let (a, _a_rx) = client(1);
        subs.subscribe("fw-1", a.clone());
        subs.subscribe("fw-2", a);
        subs.unsubscribe("fw-1", 1);
        assert_eq!(subs.subscriber_count("fw-1"), 0);
        assert_eq!(subs.subscriber_count("fw-2"), 1);
        subs.remove_connection(1);
        assert_eq!(subs.subscriber_count("fw-2"), 0);
    }

    #[test]
    fn closed_connections_are_pruned() {
        let subs = DeviceSubscriptions::new();
        let (a, a_rx) = client(1);
        subs.subscribe("fw-1", a);
        drop(a_rx);
        assert_eq!(subs.publish("fw-1", DeviceStatus::Online), 0);
        assert_eq!(subs.subscriber_count("fw-1"), 0);
    }
}
