//! Mesh orchestration.
//!
//! A single tokio task owns every mutable table (peer table, dedup cache,
//! fragment sessions, delivery records) and drives the whole protocol:
//! transport events in, delegate events out, relays re-injected toward the
//! transport after jitter. [`MeshService`] is the cloneable handle the
//! presentation layer talks to; it forwards commands over a channel so no
//! two contexts ever mutate the same table.

use bytes::Bytes;
use chatmesh_fragment::{Fragmenter, Reassembler, Recovered};
use chatmesh_wire::{ChatMessage, MessageKind, Packet, PeerId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::dedup::DedupCache;
use crate::delegate::MeshDelegate;
use crate::delivery::{DeliveryRecord, DeliveryTracker};
use crate::error::MeshError;
use crate::peers::{validate_announce, PeerRecord, PeerTable};
use crate::relay::{RelayDecision, RelayEngine};
use crate::transport::{LinkId, Transport, TransportError, TransportEvent};

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

enum Command {
    Broadcast {
        content: String,
        mentions: Vec<String>,
        channel: Option<String>,
        reply: oneshot::Sender<Result<String, MeshError>>,
    },
    Private {
        content: String,
        recipient: PeerId,
        reply: oneshot::Sender<Result<String, MeshError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running mesh service.
///
/// Cloneable and cheap; every method forwards to the orchestrator task.
/// After [`stop`](MeshService::stop) all sends fail with
/// [`MeshError::NotRunning`].
#[derive(Clone)]
pub struct MeshService {
    commands: mpsc::Sender<Command>,
    delivery: Arc<DeliveryTracker>,
}

impl MeshService {
    /// Start the orchestrator task.
    ///
    /// `events` is the transport's inbound event channel; `transport` is its
    /// write side. The delegate receives chat and peer events on the
    /// orchestrator's dispatch path.
    pub fn start(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn MeshDelegate>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> MeshService {
        let (command_tx, command_rx) = mpsc::channel(64);
        let delivery = Arc::new(DeliveryTracker::new());

        let orchestrator = MeshOrchestrator {
            fragmenter: Fragmenter::new(config.write_capacity),
            reassembler: Reassembler::with_limits(
                config.max_fragment_sessions,
                config.fragment_timeout,
                config.fragment_byte_budget,
            ),
            dedup: DedupCache::new(config.dedup_capacity),
            relay: RelayEngine::new(
                config.relay_probability,
                config.relay_jitter_min,
                config.relay_jitter_max,
            ),
            peers: PeerTable::new(),
            delivery: Arc::clone(&delivery),
            links: HashSet::new(),
            config,
            transport,
            delegate,
        };

        tokio::spawn(orchestrator.run(events, command_rx));

        MeshService {
            commands: command_tx,
            delivery,
        }
    }

    /// Send a chat message to every reachable peer
    pub async fn send_broadcast(
        &self,
        content: impl Into<String>,
        mentions: Vec<String>,
        channel: Option<String>,
    ) -> Result<String, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Broadcast {
                content: content.into(),
                mentions,
                channel,
                reply,
            })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        response.await.map_err(|_| MeshError::NotRunning)?
    }

    /// Send a chat message to one peer
    pub async fn send_private(
        &self,
        content: impl Into<String>,
        recipient: PeerId,
    ) -> Result<String, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Private {
                content: content.into(),
                recipient,
                reply,
            })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        response.await.map_err(|_| MeshError::NotRunning)?
    }

    /// Snapshot of every known peer
    pub async fn peers(&self) -> Result<Vec<PeerRecord>, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Peers { reply })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        response.await.map_err(|_| MeshError::NotRunning)
    }

    /// Delivery state of an outbound message, by id
    pub fn delivery_status(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.delivery.status(message_id)
    }

    /// Stop the service.
    ///
    /// Best-effort LEAVE broadcast, then link teardown, then table teardown.
    /// Idempotent; a second call reports [`MeshError::NotRunning`].
    pub async fn stop(&self) -> Result<(), MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        response.await.map_err(|_| MeshError::NotRunning)
    }
}

struct MeshOrchestrator {
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn MeshDelegate>,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    dedup: DedupCache,
    relay: RelayEngine,
    peers: PeerTable,
    delivery: Arc<DeliveryTracker>,
    links: HashSet<LinkId>,
}

impl MeshOrchestrator {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        info!(peer = %self.config.peer_id, nickname = %self.config.nickname, "mesh service started");

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Jittered relays pending re-injection. Owned here so shutdown can
        // cancel the whole group; a late firing after stop has no task left
        // to touch torn-down state.
        let mut relays: JoinSet<Packet> = JoinSet::new();

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_transport_event(event, &mut relays).await;
                }

                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                relays.abort_all();
                                break;
                            }
                        }
                        // Every handle dropped: tear down as if stopped
                        None => {
                            relays.abort_all();
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                _ = sweep.tick() => {
                    self.run_sweep(&mut relays);
                }

                Some(joined) = relays.join_next(), if !relays.is_empty() => {
                    if let Ok(packet) = joined {
                        self.write_relay(packet).await;
                    }
                }
            }
        }

        info!(peer = %self.config.peer_id, "mesh service stopped");
    }

    async fn handle_transport_event(&mut self, event: TransportEvent, relays: &mut JoinSet<Packet>) {
        match event {
            TransportEvent::Connected { link } => {
                debug!(link, "link up");
                self.links.insert(link);
                self.send_announce(link).await;
            }

            TransportEvent::BytesReceived { link, bytes } => {
                match Packet::decode(&bytes) {
                    Ok(packet) => self.process_packet(packet, Some(link), relays),
                    // Malformed input is a decode failure, never a fault
                    Err(error) => debug!(link, %error, "undecodable packet dropped"),
                }
            }

            TransportEvent::Disconnected { link } => {
                debug!(link, "link down");
                self.links.remove(&link);
                let gone = self.peers.remove_by_link(link);
                for peer in &gone {
                    self.delegate.on_peer_disconnected(*peer);
                }
                if !gone.is_empty() {
                    self.delegate.on_peer_list_changed();
                }
            }
        }
    }

    /// Returns `true` when the orchestrator should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Broadcast {
                content,
                mentions,
                channel,
                reply,
            } => {
                let message = ChatMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    sender: self.config.nickname.clone(),
                    content,
                    timestamp: now_millis(),
                    mentions: if mentions.is_empty() { None } else { Some(mentions) },
                    channel,
                    ..Default::default()
                };
                let result = self.send_chat(message, None).await;
                reply.send(result).ok();
                false
            }

            Command::Private {
                content,
                recipient,
                reply,
            } => {
                let message = ChatMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    sender: self.config.nickname.clone(),
                    content,
                    timestamp: now_millis(),
                    is_private: true,
                    recipient_nickname: self.peers.nickname(recipient).map(str::to_string),
                    ..Default::default()
                };
                let result = self.send_chat(message, Some(recipient)).await;
                reply.send(result).ok();
                false
            }

            Command::Peers { reply } => {
                reply.send(self.peers.snapshot()).ok();
                false
            }

            Command::Stop { reply } => {
                self.shutdown().await;
                reply.send(()).ok();
                true
            }
        }
    }

    /// Process one decoded packet and everything it releases.
    ///
    /// Reassembled packets re-enter the same path as if freshly received,
    /// so the loop drains a queue rather than recursing.
    fn process_packet(&mut self, packet: Packet, link: Option<LinkId>, relays: &mut JoinSet<Packet>) {
        let mut queue = VecDeque::new();
        queue.push_back(packet);

        while let Some(packet) = queue.pop_front() {
            // A spent hop budget means the packet is never processed
            if packet.ttl == 0 {
                trace!(kind = ?packet.kind, "ttl exhausted on receipt");
                continue;
            }

            // Our own traffic echoed back through the mesh
            if packet.sender == self.config.peer_id {
                continue;
            }

            if !self.dedup.insert(packet.dedup_key()) {
                trace!(sender = %packet.sender, "duplicate transmission dropped");
                continue;
            }

            // Invalid announces are dropped before any state mutation,
            // relay included
            if packet.kind == MessageKind::Announce && !validate_announce(&packet.payload) {
                warn!(sender = %packet.sender, len = packet.payload.len(), "invalid announce rejected");
                continue;
            }

            let now = Instant::now();
            if self.peers.observe(packet.sender, link, now) {
                self.delegate.on_peer_connected(packet.sender);
                self.delegate.on_peer_list_changed();
            }

            self.dispatch(&packet, link, now, &mut queue);

            match self.relay.decide(&packet) {
                RelayDecision::Relay { packet, delay } => {
                    trace!(kind = ?packet.kind, ttl = packet.ttl, ?delay, "relay scheduled");
                    relays.spawn(async move {
                        tokio::time::sleep(delay).await;
                        packet
                    });
                }
                RelayDecision::Drop(reason) => {
                    trace!(?reason, "not relaying");
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        packet: &Packet,
        link: Option<LinkId>,
        now: Instant,
        queue: &mut VecDeque<Packet>,
    ) {
        match packet.kind {
            MessageKind::Announce => {
                // Validated printable ASCII, so UTF-8 cannot fail here
                let Ok(nickname) = String::from_utf8(packet.payload.to_vec()) else {
                    return;
                };
                if self.peers.apply_announce(packet.sender, nickname, link, now) {
                    self.delegate.on_peer_list_changed();
                }
            }

            MessageKind::Leave => {
                if self.peers.remove(packet.sender).is_some() {
                    self.delegate.on_peer_disconnected(packet.sender);
                    self.delegate.on_peer_list_changed();
                }
            }

            MessageKind::Message => {
                if !packet.addressed_to(self.config.peer_id) {
                    return;
                }
                match ChatMessage::decode(&packet.payload) {
                    Ok(mut message) => {
                        message.sender_peer_id = Some(packet.sender.to_string());
                        self.delegate.on_message(message);
                    }
                    Err(error) => debug!(sender = %packet.sender, %error, "undecodable chat payload"),
                }
            }

            MessageKind::FragmentStart
            | MessageKind::FragmentContinue
            | MessageKind::FragmentEnd => match self.reassembler.accept(packet, now) {
                Ok(Some(reassembled)) => {
                    debug!(kind = ?reassembled.kind, "reassembled packet re-entering dispatch");
                    queue.push_back(reassembled);
                }
                Ok(None) => {}
                Err(error) => debug!(sender = %packet.sender, %error, "fragment dropped"),
            },

            MessageKind::DeliveryAck => {
                if packet.addressed_to(self.config.peer_id) {
                    if let Ok(message_id) = std::str::from_utf8(&packet.payload) {
                        self.delivery.mark_delivered(message_id, packet.timestamp);
                    }
                }
            }

            MessageKind::ReadReceipt => {
                if packet.addressed_to(self.config.peer_id) {
                    if let Ok(message_id) = std::str::from_utf8(&packet.payload) {
                        self.delivery.mark_read(message_id, packet.timestamp);
                    }
                }
            }

            // Channel metadata and the reserved handshake range are relayed
            // for the peers that understand them; no local handler
            MessageKind::ChannelAnnounce => {
                trace!(sender = %packet.sender, "channel announce ignored");
            }
            MessageKind::Reserved(value) => {
                trace!(sender = %packet.sender, value, "reserved type ignored");
            }
        }
    }

    async fn send_chat(
        &mut self,
        message: ChatMessage,
        recipient: Option<PeerId>,
    ) -> Result<String, MeshError> {
        if self.links.is_empty() {
            return Err(MeshError::NoLinks);
        }

        let message_id = message.id.clone();
        let timestamp = message.timestamp;
        let payload = message.encode()?;

        let packet = match recipient {
            Some(peer) => Packet::private(
                MessageKind::Message,
                self.config.peer_id,
                peer,
                timestamp,
                payload,
            ),
            None => Packet::broadcast(MessageKind::Message, self.config.peer_id, timestamp, payload),
        }
        .with_ttl(self.config.max_ttl);

        let fragments = self.fragmenter.split(packet)?;
        let mut delivered = false;
        for fragment in fragments {
            // Recording our own keys stops relayed echoes from reprocessing
            self.dedup.insert(fragment.dedup_key());
            let bytes = fragment.encode()?;
            delivered |= self.write_links(bytes).await > 0;
        }

        // At-most-once: a failed write is reported, never retried
        if !delivered {
            return Err(MeshError::Transport(TransportError::Write(
                "no link accepted the packet".into(),
            )));
        }

        self.delivery.track(message_id.clone(), timestamp);
        Ok(message_id)
    }

    async fn send_announce(&mut self, link: LinkId) {
        let packet = Packet::broadcast(
            MessageKind::Announce,
            self.config.peer_id,
            now_millis(),
            Bytes::from(self.config.nickname.clone().into_bytes()),
        )
        .with_ttl(self.config.announce_ttl);

        self.dedup.insert(packet.dedup_key());
        match packet.encode() {
            Ok(bytes) => {
                if let Err(error) = self.transport.write(link, bytes).await {
                    warn!(link, %error, "announce write failed");
                }
            }
            Err(error) => warn!(%error, "announce encode failed"),
        }
    }

    async fn write_relay(&mut self, packet: Packet) {
        match packet.encode() {
            Ok(bytes) => {
                let written = self.write_links(bytes).await;
                trace!(kind = ?packet.kind, ttl = packet.ttl, written, "relayed");
            }
            Err(error) => warn!(%error, "relay encode failed"),
        }
    }

    /// Write to every connected link, returning the success count
    async fn write_links(&mut self, bytes: Bytes) -> usize {
        let links: Vec<LinkId> = self.links.iter().copied().collect();
        let mut written = 0;
        for link in links {
            match self.transport.write(link, bytes.clone()).await {
                Ok(()) => written += 1,
                Err(error) => warn!(link, %error, "link write failed"),
            }
        }
        written
    }

    fn run_sweep(&mut self, relays: &mut JoinSet<Packet>) {
        for recovered in self.reassembler.sweep(Instant::now()) {
            match recovered {
                Recovered::Packet(packet) => {
                    debug!(kind = ?packet.kind, "salvaged packet re-entering dispatch");
                    self.process_packet(packet, None, relays);
                }
                Recovered::Message { sender, mut message } => {
                    message.sender_peer_id = Some(sender.to_string());
                    self.delegate.on_message(message);
                }
            }
        }
        self.delivery.sweep(self.config.delivery_retention);
    }

    async fn shutdown(&mut self) {
        info!(peer = %self.config.peer_id, "stopping mesh service");

        // Best-effort LEAVE so peers drop us before their timeouts do
        let leave = Packet::broadcast(
            MessageKind::Leave,
            self.config.peer_id,
            now_millis(),
            Bytes::new(),
        )
        .with_ttl(self.config.announce_ttl);
        if let Ok(bytes) = leave.encode() {
            self.write_links(bytes).await;
        }

        for link in self.links.drain().collect::<Vec<_>>() {
            self.transport.disconnect(link).await;
        }

        self.peers.clear();
        self.dedup.clear();
        self.reassembler.clear();
        self.delivery.clear();
    }
}
