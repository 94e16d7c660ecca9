use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::settings::MqttSettings;

use super::{DeliveryMode, PublishError, Publisher};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Broker link as seen by the event loop task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Link {
    connected: bool,
    /// PUBLISH packets written to the socket since startup.
    sent: u64,
}

pub struct MqttPublisher {
    client: AsyncClient,
    link: watch::Receiver<Link>,
    event_loop: JoinHandle<()>,
    cancel: CancellationToken,
}

impl MqttPublisher {
    /// Spawns the connection task. The broker does not have to be reachable
    /// yet; rumqttc keeps reconnecting while `cancel` is live.
    pub fn connect(settings: &MqttSettings, device_id: &str, shutdown: &CancellationToken) -> Self {
        let mut options = MqttOptions::new(client_id(device_id), settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        options.set_clean_session(true);

        log_info!(
            "mqtt: connecting to {}:{} as {}",
            settings.host,
            settings.port,
            client_id(device_id)
        );

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (link_tx, link) = watch::channel(Link::default());
        let cancel = shutdown.child_token();
        let event_loop = tokio::spawn(drive_event_loop(event_loop, link_tx, cancel.clone()));

        Self {
            client,
            link,
            event_loop,
            cancel,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.borrow().connected
    }

    /// Sends DISCONNECT and waits for the event loop to flush it. If the
    /// broker is unreachable the loop is cancelled after a short grace period.
    pub async fn disconnect(self) {
        let Self {
            client,
            mut event_loop,
            cancel,
            ..
        } = self;

        if cancel.is_cancelled() {
            log_debug!("mqtt: event loop already cancelled, skipping DISCONNECT");
        } else if let Err(err) = client.try_disconnect() {
            log_debug!("mqtt: disconnect request failed: {err}");
        }

        if tokio::time::timeout(DISCONNECT_GRACE, &mut event_loop).await.is_err() {
            log_warn!("mqtt: event loop did not stop within {:?}", DISCONNECT_GRACE);
            cancel.cancel();
            let _ = event_loop.await;
        }
    }
}

pub fn client_id(device_id: &str) -> String {
    format!("zero2-{device_id}")
}

#[async_trait]
impl Publisher for MqttPublisher {
    /// Succeeds once the PUBLISH has been written to a live connection.
    /// Nothing is queued while the broker is unreachable. Callers publish
    /// one snapshot at a time and bound the wait with their own timeout.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), PublishError> {
        let mut link = self.link.clone();
        let before = *link.borrow_and_update();
        if !before.connected {
            return Err(PublishError::Client("not connected to broker".into()));
        }

        let bytes = payload.len();
        self.client
            .try_publish(topic, QoS::AtMostOnce, mode.retain(), payload)
            .map_err(|err| PublishError::Client(err.to_string()))?;

        let after = match link.wait_for(|l| l.sent > before.sent || !l.connected).await {
            Ok(state) => *state,
            Err(_) => return Err(PublishError::Client("connection task stopped".into())),
        };
        if after.sent == before.sent {
            return Err(PublishError::Client(
                "connection lost before the publish was written".into(),
            ));
        }

        log_debug!("mqtt: sent {bytes} bytes on {topic} (retain={})", mode.retain());
        Ok(())
    }
}

/// Folds one event into the link state. Returns true once our own
/// DISCONNECT has gone out.
fn observe(link: &watch::Sender<Link>, event: &Event) -> bool {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            let accepted = ack.code == ConnectReturnCode::Success;
            if accepted {
                log_info!("mqtt: connected");
            } else {
                log_warn!("mqtt: connection refused ({:?})", ack.code);
            }
            link.send_modify(|l| l.connected = accepted);
        }
        Event::Incoming(Packet::Disconnect) => {
            log_warn!("mqtt: broker closed the session");
            link.send_modify(|l| l.connected = false);
        }
        Event::Outgoing(Outgoing::Publish(_)) => {
            link.send_modify(|l| l.sent += 1);
        }
        Event::Outgoing(Outgoing::Disconnect) => {
            log_info!("mqtt: disconnected");
            link.send_modify(|l| l.connected = false);
            return true;
        }
        _ => {}
    }
    false
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    link: watch::Sender<Link>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => match event {
                Ok(event) => {
                    if observe(&link, &event) {
                        break;
                    }
                }
                Err(err) => {
                    link.send_modify(|l| l.connected = false);
                    log_warn!("mqtt: connection error: {err}; retrying in {:?}", RECONNECT_BACKOFF);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    }
                }
            },
        }
    }
    link.send_modify(|l| l.connected = false);
    log_info!("mqtt: event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_prefixed() {
        assert_eq!(client_id("pi-07"), "zero2-pi-07");
    }

    #[test]
    fn delivery_mode_maps_to_retain_flag() {
        assert!(DeliveryMode::Retained.retain());
        assert!(!DeliveryMode::AtMostOnce.retain());
    }

    /// Publisher wired to a link the test drives by hand. The event loop is
    /// returned so the request channel stays open.
    fn detached(connected: bool) -> (MqttPublisher, watch::Sender<Link>, EventLoop) {
        let options = MqttOptions::new("zero2-test", "127.0.0.1", 1);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (link_tx, link) = watch::channel(Link {
            connected,
            sent: 0,
        });
        let publisher = MqttPublisher {
            client,
            link,
            event_loop: tokio::spawn(async {}),
            cancel: CancellationToken::new(),
        };
        (publisher, link_tx, event_loop)
    }

    #[tokio::test]
    async fn publish_is_refused_without_a_broker() {
        let cancel = CancellationToken::new();
        let settings = MqttSettings {
            host: "127.0.0.1".into(),
            port: 1,
            ..MqttSettings::default()
        };
        let publisher = MqttPublisher::connect(&settings, "test", &cancel);

        for _ in 0..(REQUEST_CHANNEL_CAPACITY + 2) {
            let result = tokio::time::timeout(
                Duration::from_millis(500),
                publisher.publish("zero2/test/sensor", b"{}".to_vec(), DeliveryMode::AtMostOnce),
            )
            .await
            .expect("publish must not block while disconnected");
            assert!(matches!(result, Err(PublishError::Client(_))));
        }
        assert!(!publisher.is_connected());

        cancel.cancel();
        publisher.disconnect().await;
    }

    #[tokio::test]
    async fn publish_completes_once_written() {
        let (publisher, link_tx, _event_loop) = detached(true);
        let publisher = std::sync::Arc::new(publisher);

        let pending = tokio::spawn({
            let publisher = publisher.clone();
            async move {
                publisher
                    .publish("zero2/test/sensor", b"{}".to_vec(), DeliveryMode::Retained)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        link_tx.send_modify(|l| l.sent += 1);
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_connection_fails_the_pending_publish() {
        let (publisher, link_tx, _event_loop) = detached(true);
        let publisher = std::sync::Arc::new(publisher);

        let pending = tokio::spawn({
            let publisher = publisher.clone();
            async move {
                publisher
                    .publish("zero2/test/sensor", b"{}".to_vec(), DeliveryMode::AtMostOnce)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        link_tx.send_modify(|l| l.connected = false);
        assert!(matches!(pending.await.unwrap(), Err(PublishError::Client(_))));
    }

    #[test]
    fn link_follows_connack_publish_and_disconnect() {
        let (link_tx, link) = watch::channel(Link::default());

        let refused = Event::Incoming(Packet::ConnAck(rumqttc::ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert!(!observe(&link_tx, &refused));
        assert!(!link.borrow().connected);

        let accepted = Event::Incoming(Packet::ConnAck(rumqttc::ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        observe(&link_tx, &accepted);
        observe(&link_tx, &Event::Outgoing(Outgoing::Publish(0)));
        assert_eq!(
            *link.borrow(),
            Link {
                connected: true,
                sent: 1
            }
        );

        assert!(observe(&link_tx, &Event::Outgoing(Outgoing::Disconnect)));
        assert!(!link.borrow().connected);
    }

    #[tokio::test]
    async fn disconnect_returns_when_broker_is_unreachable() {
        let settings = MqttSettings {
            host: "127.0.0.1".into(),
            port: 1,
            ..MqttSettings::default()
        };
        let publisher = MqttPublisher::connect(&settings, "test", &CancellationToken::new());

        let started = std::time::Instant::now();
        publisher.disconnect().await;
        assert!(started.elapsed() < DISCONNECT_GRACE + Duration::from_secs(2));
    }
}
