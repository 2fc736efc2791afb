//! MQTT Client Connection
//!
//! A single connection to a remote MQTT broker driven by one task. Callers
//! talk to the task over a command channel; the task owns the socket,
//! packet identifiers and in-flight acknowledgement state, keeps the
//! connection alive and reconnects with exponential backoff once an
//! established connection is lost.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::config::ConnectionConfig;
use crate::protocol::{
    Connect, Packet, PacketAck, ProtocolVersion, Publish, QoS, SubAck, Subscribe,
    REASON_FAILURE_THRESHOLD,
};
use crate::remote::{InboundMessage, RemoteError, RemotePeerStatus};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// How long `disconnect` waits for the connection task to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to (re)establish a connection
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name used in logs
    pub name: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol_version: ProtocolVersion,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
}

impl ClientOptions {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
    ) -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            name: name.into(),
            host: host.into(),
            port,
            client_id: client_id.into(),
            clean_start: true,
            keep_alive: defaults.keep_alive,
            username: None,
            password: None,
            protocol_version: ProtocolVersion::V5,
            connect_timeout: defaults.connect_timeout,
            reconnect_interval: defaults.reconnect_interval,
            max_reconnect_interval: defaults.max_reconnect_interval,
        }
    }

    /// Options for `host:port` with the shared connection settings applied
    pub fn from_config(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        config: &ConnectionConfig,
        role: &str,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            client_id: config.client_id_or_default(role),
            clean_start: true,
            keep_alive: config.keep_alive,
            username: config.username.clone(),
            password: config.password.clone(),
            protocol_version: config.protocol().unwrap_or(ProtocolVersion::V5),
            connect_timeout: config.connect_timeout,
            reconnect_interval: config.reconnect_interval,
            max_reconnect_interval: config.max_reconnect_interval,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Completion handle of a SUBSCRIBE: the SUBACK return codes
pub type SubAckReceiver = oneshot::Receiver<Result<Vec<u8>, RemoteError>>;

/// Message to the connection task
#[derive(Debug)]
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        done: oneshot::Sender<Result<(), RemoteError>>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        done: oneshot::Sender<Result<Vec<u8>, RemoteError>>,
    },
    /// Release the deferred acknowledgement of an inbound message
    Ack { topic: String, offset: i64 },
    Shutdown,
}

/// Handle to a connected MQTT client
pub struct MqttClient {
    name: String,
    status: Arc<RwLock<RemotePeerStatus>>,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Connect and spawn the connection task.
    ///
    /// Inbound PUBLISH packets are delivered on `inbound` when given and
    /// their acknowledgement is held back until [`MqttClient::ack`].
    /// Without `inbound` they are acknowledged and discarded.
    pub async fn connect(
        options: ClientOptions,
        inbound: Option<mpsc::Sender<InboundMessage>>,
    ) -> Result<Self, RemoteError> {
        let status = Arc::new(RwLock::new(RemotePeerStatus::Connecting));
        let transport = match Transport::establish(&options).await {
            Ok(transport) => transport,
            Err(e) => {
                *status.write() = RemotePeerStatus::Disconnected;
                return Err(e);
            }
        };
        *status.write() = RemotePeerStatus::Connected;

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let name = options.name.clone();
        let task = ConnectionTask {
            options,
            status: status.clone(),
            commands: command_rx,
            session: Session::new(inbound),
        };
        let handle = tokio::spawn(task.run(transport));

        Ok(Self {
            name,
            status,
            commands,
            task: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    /// Publish and wait for the acknowledgement flow of `qos` to complete
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
                done,
            })
            .await
            .map_err(|_| RemoteError::NotConnected)?;

        result.await.map_err(|_| {
            RemoteError::ConnectionLost("connection task stopped".to_string())
        })?
    }

    /// Queue a SUBSCRIBE; the returned receiver resolves on SUBACK.
    /// Filters are re-subscribed after every reconnect.
    pub async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<SubAckReceiver, RemoteError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { filters, done })
            .await
            .map_err(|_| RemoteError::NotConnected)?;
        Ok(result)
    }

    /// Release the acknowledgement of an inbound message. Never blocks.
    pub fn ack(&self, topic: &str, offset: i64) {
        let command = Command::Ack {
            topic: topic.to_string(),
            offset,
        };
        if !send_or_defer(&self.commands, command) {
            debug!("MQTT '{}': Connection task gone, ack for {} dropped", self.name, topic);
        }
    }

    /// Send DISCONNECT and wait for the connection task to finish
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("MQTT '{}': Connection task did not stop in time", self.name);
            }
        }
        *self.status.write() = RemotePeerStatus::Disconnected;
    }
}

/// Queue `command` without blocking the caller. When the channel is full
/// the send is finished from a spawned task so the command is never lost.
/// Returns false if the connection task is gone.
fn send_or_defer(commands: &mpsc::Sender<Command>, command: Command) -> bool {
    match commands.try_send(command) {
        Ok(()) => true,
        Err(TrySendError::Full(command)) => {
            let commands = commands.clone();
            tokio::spawn(async move {
                let _ = commands.send(command).await;
            });
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Framed socket for one TCP session
struct Transport {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Transport {
    /// TCP connect, CONNECT, and wait for a successful CONNACK
    async fn establish(options: &ClientOptions) -> Result<Self, RemoteError> {
        let address = options.address();
        let stream = timeout(options.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::Connect(format!("{}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);

        debug!("MQTT '{}': TCP connected to {}", options.name, address);

        let (reader, writer) = stream.into_split();
        let mut transport = Transport {
            reader,
            writer,
            encoder: Encoder::new(options.protocol_version),
            decoder: Decoder::new(options.protocol_version),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        };

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: options.protocol_version,
            client_id: options.client_id.clone(),
            clean_start: options.clean_start,
            keep_alive: options.keep_alive,
            username: options.username.clone(),
            password: options.password.as_ref().map(|p| Bytes::from(p.clone())),
        }));
        transport.send(&connect).await?;

        let packet = timeout(options.connect_timeout, transport.recv())
            .await
            .map_err(|_| RemoteError::Timeout)??;

        match packet {
            Packet::ConnAck(connack) if connack.reason_code == 0 => {
                info!(
                    "MQTT '{}': Connected to {} (session_present={})",
                    options.name, address, connack.session_present
                );
                Ok(transport)
            }
            Packet::ConnAck(connack) => Err(RemoteError::Rejected(format!(
                "CONNACK reason code 0x{:02X}",
                connack.reason_code
            ))),
            other => Err(RemoteError::Protocol(format!(
                "expected CONNACK, got packet type {}",
                other.packet_type()
            ))),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), RemoteError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))
    }

    /// Next complete packet already in the read buffer
    fn next_buffered(&mut self) -> Result<Option<Packet>, RemoteError> {
        match self
            .decoder
            .decode(&self.read_buf)
            .map_err(|e| RemoteError::Protocol(e.to_string()))?
        {
            Some((packet, len)) => {
                self.read_buf.advance(len);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Read more bytes from the socket. Cancel safe.
    async fn fill(&mut self) -> Result<(), RemoteError> {
        let n = self
            .reader
            .read_buf(&mut self.read_buf)
            .await
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
        if n == 0 {
            return Err(RemoteError::ConnectionLost(
                "connection closed by peer".to_string(),
            ));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Packet, RemoteError> {
        loop {
            if let Some(packet) = self.next_buffered()? {
                return Ok(packet);
            }
            self.fill().await?;
        }
    }
}

struct PendingPublish {
    done: oneshot::Sender<Result<(), RemoteError>>,
}

/// State that outlives a single TCP session
struct Session {
    last_packet_id: u16,
    publishes: HashMap<u16, PendingPublish>,
    subscribes: HashMap<u16, oneshot::Sender<Result<Vec<u8>, RemoteError>>>,
    /// Every filter ever subscribed, replayed after reconnect
    subscriptions: Vec<(String, QoS)>,
    resubscribe: bool,
    inbound: Option<mpsc::Sender<InboundMessage>>,
    /// Inbound acknowledgements held until the message is handed off
    deferred_acks: HashMap<(String, i64), (u16, QoS)>,
    /// QoS 2 packet ids received and not yet released
    awaiting_release: HashSet<u16>,
    /// Next offset per topic
    offsets: HashMap<String, i64>,
    awaiting_pong: bool,
}

impl Session {
    fn new(inbound: Option<mpsc::Sender<InboundMessage>>) -> Self {
        Self {
            last_packet_id: 0,
            publishes: HashMap::new(),
            subscribes: HashMap::new(),
            subscriptions: Vec::new(),
            resubscribe: false,
            inbound,
            deferred_acks: HashMap::new(),
            awaiting_release: HashSet::new(),
            offsets: HashMap::new(),
            awaiting_pong: false,
        }
    }

    /// Next free non-zero packet identifier
    fn next_packet_id(&mut self) -> u16 {
        loop {
            self.last_packet_id = self.last_packet_id.wrapping_add(1);
            let id = self.last_packet_id;
            if id != 0 && !self.publishes.contains_key(&id) && !self.subscribes.contains_key(&id) {
                return id;
            }
        }
    }

    fn next_offset(&mut self, topic: &str) -> i64 {
        let next = self.offsets.entry(topic.to_string()).or_insert(0);
        let offset = *next;
        *next += 1;
        offset
    }

    /// Fail everything in flight; acknowledgements are not carried over
    fn connection_lost(&mut self, reason: &RemoteError) {
        for (_, pending) in self.publishes.drain() {
            let _ = pending.done.send(Err(reason.clone()));
        }
        for (_, done) in self.subscribes.drain() {
            let _ = done.send(Err(reason.clone()));
        }
        self.deferred_acks.clear();
        self.awaiting_release.clear();
        self.awaiting_pong = false;
        self.resubscribe = !self.subscriptions.is_empty();
    }
}

fn check_reason(reason_code: u8, packet: &str) -> Result<(), RemoteError> {
    if reason_code >= REASON_FAILURE_THRESHOLD {
        Err(RemoteError::Rejected(format!(
            "{} reason code 0x{:02X}",
            packet, reason_code
        )))
    } else {
        Ok(())
    }
}

struct ConnectionTask {
    options: ClientOptions,
    status: Arc<RwLock<RemotePeerStatus>>,
    commands: mpsc::Receiver<Command>,
    session: Session,
}

impl ConnectionTask {
    async fn run(mut self, mut transport: Transport) {
        let name = self.options.name.clone();

        loop {
            let err = match self.serve(&mut transport).await {
                Ok(()) => {
                    info!("MQTT '{}': Disconnected", name);
                    *self.status.write() = RemotePeerStatus::Disconnected;
                    return;
                }
                Err(e) => e,
            };

            warn!("MQTT '{}': Connection lost: {}", name, err);
            self.session.connection_lost(&err);

            let mut retry_interval = self.options.reconnect_interval;
            loop {
                *self.status.write() = RemotePeerStatus::Backoff;
                debug!("MQTT '{}': Reconnecting in {:?}", name, retry_interval);

                if self.backoff(retry_interval).await {
                    info!("MQTT '{}': Shutdown requested during backoff", name);
                    *self.status.write() = RemotePeerStatus::Disconnected;
                    return;
                }
                retry_interval = std::cmp::min(retry_interval * 2, self.options.max_reconnect_interval);

                *self.status.write() = RemotePeerStatus::Connecting;
                match Transport::establish(&self.options).await {
                    Ok(reconnected) => {
                        transport = reconnected;
                        *self.status.write() = RemotePeerStatus::Connected;
                        break;
                    }
                    Err(e) => warn!("MQTT '{}': Reconnect failed: {}", name, e),
                }
            }
        }
    }

    /// Sleep for `delay` while refusing work. Returns true on shutdown.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return true,
                    Some(Command::Publish { done, .. }) => {
                        let _ = done.send(Err(RemoteError::NotConnected));
                    }
                    Some(Command::Subscribe { filters, done }) => {
                        self.session.subscriptions.extend(filters);
                        self.session.resubscribe = true;
                        let _ = done.send(Err(RemoteError::NotConnected));
                    }
                    Some(Command::Ack { .. }) => {}
                },
            }
        }
    }

    /// Run one established session. `Ok` means a requested shutdown.
    async fn serve(&mut self, transport: &mut Transport) -> Result<(), RemoteError> {
        if self.session.resubscribe {
            let packet_id = self.session.next_packet_id();
            let filters = self.session.subscriptions.clone();
            debug!(
                "MQTT '{}': Resubscribing to {} filters",
                self.options.name,
                filters.len()
            );
            transport
                .send(&Packet::Subscribe(Subscribe { packet_id, filters }))
                .await?;
            self.session.resubscribe = false;
        }

        let keep_alive = self.options.keep_alive;
        let period = Duration::from_secs(u64::from(keep_alive.max(1)));
        let mut keepalive = tokio::time::interval(period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = transport.send(&Packet::Disconnect).await;
                        return Ok(());
                    }
                    Some(cmd) => self.handle_command(transport, cmd).await?,
                },

                filled = transport.fill() => {
                    filled?;
                    while let Some(packet) = transport.next_buffered()? {
                        self.handle_packet(transport, packet).await?;
                    }
                }

                _ = keepalive.tick(), if keep_alive > 0 => {
                    if self.session.awaiting_pong {
                        return Err(RemoteError::ConnectionLost("keep-alive timeout".to_string()));
                    }
                    transport.send(&Packet::PingReq).await?;
                    self.session.awaiting_pong = true;
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        transport: &mut Transport,
        cmd: Command,
    ) -> Result<(), RemoteError> {
        match cmd {
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                done,
            } => {
                let packet_id = (qos != QoS::AtMostOnce).then(|| self.session.next_packet_id());
                let publish = Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain,
                    topic,
                    packet_id,
                    payload,
                    user_properties: Vec::new(),
                });

                if let Err(e) = transport.send(&publish).await {
                    let _ = done.send(Err(e.clone()));
                    return match e {
                        RemoteError::Protocol(_) => Ok(()),
                        e => Err(e),
                    };
                }

                match packet_id {
                    None => {
                        let _ = done.send(Ok(()));
                    }
                    Some(id) => {
                        self.session.publishes.insert(id, PendingPublish { done });
                    }
                }
            }
            Command::Subscribe { filters, done } => {
                let packet_id = self.session.next_packet_id();
                self.session.subscriptions.extend(filters.iter().cloned());
                self.session.subscribes.insert(packet_id, done);
                transport
                    .send(&Packet::Subscribe(Subscribe { packet_id, filters }))
                    .await?;
            }
            Command::Ack { topic, offset } => {
                if let Some((packet_id, qos)) = self.session.deferred_acks.remove(&(topic, offset)) {
                    let ack = PacketAck::new(packet_id);
                    let packet = match qos {
                        QoS::ExactlyOnce => Packet::PubRec(ack),
                        _ => Packet::PubAck(ack),
                    };
                    transport.send(&packet).await?;
                }
            }
            Command::Shutdown => {}
        }
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        transport: &mut Transport,
        packet: Packet,
    ) -> Result<(), RemoteError> {
        match packet {
            Packet::Publish(publish) => self.handle_inbound(transport, publish).await?,
            Packet::PubAck(ack) => {
                if let Some(pending) = self.session.publishes.remove(&ack.packet_id) {
                    let _ = pending.done.send(check_reason(ack.reason_code, "PUBACK"));
                }
            }
            Packet::PubRec(ack) => {
                if let Err(e) = check_reason(ack.reason_code, "PUBREC") {
                    if let Some(pending) = self.session.publishes.remove(&ack.packet_id) {
                        let _ = pending.done.send(Err(e));
                    }
                } else {
                    transport
                        .send(&Packet::PubRel(PacketAck::new(ack.packet_id)))
                        .await?;
                }
            }
            Packet::PubComp(ack) => {
                if let Some(pending) = self.session.publishes.remove(&ack.packet_id) {
                    let _ = pending.done.send(check_reason(ack.reason_code, "PUBCOMP"));
                }
            }
            Packet::PubRel(ack) => {
                self.session.awaiting_release.remove(&ack.packet_id);
                transport
                    .send(&Packet::PubComp(PacketAck::new(ack.packet_id)))
                    .await?;
            }
            Packet::SubAck(suback) => self.handle_suback(suback),
            Packet::PingResp => self.session.awaiting_pong = false,
            Packet::Disconnect => {
                return Err(RemoteError::ConnectionLost(
                    "server sent DISCONNECT".to_string(),
                ));
            }
            other => debug!(
                "MQTT '{}': Ignoring packet type {}",
                self.options.name,
                other.packet_type()
            ),
        }
        Ok(())
    }

    fn handle_suback(&mut self, suback: SubAck) {
        let rejected = suback
            .return_codes
            .iter()
            .filter(|code| **code >= REASON_FAILURE_THRESHOLD)
            .count();
        if rejected > 0 {
            warn!(
                "MQTT '{}': {} of {} subscriptions rejected",
                self.options.name,
                rejected,
                suback.return_codes.len()
            );
        }
        match self.session.subscribes.remove(&suback.packet_id) {
            Some(done) => {
                let _ = done.send(Ok(suback.return_codes));
            }
            None => debug!("MQTT '{}': Resubscribed", self.options.name),
        }
    }

    async fn handle_inbound(
        &mut self,
        transport: &mut Transport,
        publish: Publish,
    ) -> Result<(), RemoteError> {
        let packet_id = publish.packet_id.filter(|_| publish.qos != QoS::AtMostOnce);

        let Some(inbound) = self.session.inbound.clone() else {
            // Nobody consumes; acknowledge and discard
            if let Some(id) = packet_id {
                let ack = PacketAck::new(id);
                let packet = match publish.qos {
                    QoS::ExactlyOnce => Packet::PubRec(ack),
                    _ => Packet::PubAck(ack),
                };
                transport.send(&packet).await?;
            }
            return Ok(());
        };

        if publish.qos == QoS::ExactlyOnce {
            if let Some(id) = packet_id {
                if !self.session.awaiting_release.insert(id) {
                    // Redelivery of a QoS 2 message we already passed on
                    if !self.session.deferred_acks.values().any(|(pid, _)| *pid == id) {
                        transport.send(&Packet::PubRec(PacketAck::new(id))).await?;
                    }
                    return Ok(());
                }
            }
        }

        let offset = self.session.next_offset(&publish.topic);
        let mut msg = InboundMessage::new(publish.topic, publish.payload)
            .with_offset(offset)
            .with_timestamp(SystemTime::now());
        for (name, value) in publish.user_properties {
            msg = msg.with_header(name, value);
        }

        if let Some(id) = packet_id {
            self.session
                .deferred_acks
                .insert((msg.topic.clone(), offset), (id, publish.qos));
        }

        if inbound.send(msg).await.is_err() {
            debug!("MQTT '{}': Inbound receiver dropped", self.options.name);
            self.session.inbound = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(offset: i64) -> Command {
        Command::Ack {
            topic: "in".to_string(),
            offset,
        }
    }

    #[tokio::test]
    async fn test_ack_survives_full_command_channel() {
        let (commands, mut rx) = mpsc::channel(1);
        assert!(send_or_defer(&commands, ack(1)));
        assert!(send_or_defer(&commands, ack(2)));

        let mut offsets = Vec::new();
        for _ in 0..2 {
            match timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(Command::Ack { offset, .. })) => offsets.push(offset),
                other => panic!("expected an ack, got {:?}", other),
            }
        }
        assert_eq!(offsets, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_ack_to_stopped_task_is_reported() {
        let (commands, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!send_or_defer(&commands, ack(1)));
    }
}
