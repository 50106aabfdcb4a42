/// Broker connection: exactly-once publishes over MQTT
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, Duration};
use url::Url;

use crate::delivery::BrokerError;

const RECONNECT_BACKOFF_SECS: u64 = 10;
const KEEP_ALIVE_SECS: u64 = 30;
const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;

/// Locally issued id of an accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    /// Broker confirmed receipt of a publish (QoS 2 complete)
    Acked(MessageId),
    Message { topic: String, payload: Vec<u8> },
    ConnectionClosed,
}

/// What the delivery pipeline needs from a broker client
///
/// Calls never block on the network; outcomes arrive as `BrokerEvent`s.
pub trait BrokerTransport: Send + Sync {
    fn is_connected(&self) -> bool;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, BrokerError>;
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Session {
    state: ConnectionState,
    client: Option<AsyncClient>,
    /// Accepted publishes not yet given a packet id, in request order
    unassigned: VecDeque<MessageId>,
    by_packet: HashMap<u16, MessageId>,
}

impl Session {
    fn reset(&mut self, state: ConnectionState, client: Option<AsyncClient>) {
        self.state = state;
        self.client = client;
        self.unassigned.clear();
        self.by_packet.clear();
    }
}

pub struct MqttBroker {
    session: Mutex<Session>,
    next_id: AtomicU64,
}

impl MqttBroker {
    pub fn new() -> Self {
        MqttBroker {
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                client: None,
                unassigned: VecDeque::new(),
                by_packet: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Connection options for an `mqtt://host[:port]` url
    pub fn options(url: &Url, client_id: &str) -> Result<MqttOptions, BrokerError> {
        if url.scheme() != "mqtt" && url.scheme() != "tcp" {
            return Err(BrokerError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| BrokerError::InvalidUrl("missing host".to_string()))?;
        let mut options = MqttOptions::new(client_id, host, url.port().unwrap_or(DEFAULT_PORT));
        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        options.set_clean_session(true);
        if !url.username().is_empty() {
            options.set_credentials(url.username(), url.password().unwrap_or(""));
        }
        Ok(options)
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect, forward events, and reconnect after a fixed backoff forever
    pub async fn run(self: Arc<Self>, options: MqttOptions, events: UnboundedSender<BrokerEvent>) {
        loop {
            info!(
                "Connecting to broker {}:{}",
                options.broker_address().0,
                options.broker_address().1
            );
            let (client, mut eventloop) = AsyncClient::new(options.clone(), REQUEST_CAPACITY);
            self.session().reset(ConnectionState::Connecting, Some(client));

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.session().state = ConnectionState::Connected;
                        info!("Connected to broker");
                        let _ = events.send(BrokerEvent::Connected);
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        let mut session = self.session();
                        if let Some(id) = session.unassigned.pop_front() {
                            session.by_packet.insert(pkid, id);
                        }
                    }
                    Ok(Event::Incoming(Packet::PubComp(comp))) => {
                        let id = self.session().by_packet.remove(&comp.pkid);
                        match id {
                            Some(id) => {
                                let _ = events.send(BrokerEvent::Acked(id));
                            }
                            None => debug!("Completion for unknown packet {}", comp.pkid),
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = events.send(BrokerEvent::Message {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Broker connection closed: {}", e);
                        break;
                    }
                }
            }

            self.session().reset(ConnectionState::Disconnected, None);
            let _ = events.send(BrokerEvent::ConnectionClosed);
            sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)).await;
        }
    }
}

impl Default for MqttBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerTransport for MqttBroker {
    fn is_connected(&self) -> bool {
        self.session().state == ConnectionState::Connected
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, BrokerError> {
        let mut session = self.session();
        if session.state != ConnectionState::Connected {
            return Err(BrokerError::NotConnected);
        }
        let client = session.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .try_publish(topic, QoS::ExactlyOnce, false, payload)
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;

        // Still under the session lock, so the packet id event cannot overtake us
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        session.unassigned.push_back(id);
        Ok(id)
    }

    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let session = self.session();
        let client = session.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .try_subscribe(topic, QoS::ExactlyOnce)
            .map_err(|e| BrokerError::Rejected(e.to_string()))
    }
}
