//! The protocol engine.
//!
//! A [`MembershipService`] owns the membership list, both caches and both
//! timer tables behind one mutex. Three kinds of tasks share it: the
//! inbound loop (one dispatch task per datagram), the prober, and timer
//! tasks. No task holds the lock across an `.await`.
//!
//! Failure is confirmed along two independent routes:
//!
//! - a probe that is not acked within `ping_timeout` marks the target
//!   Suspect, announces it and arms a suspicion timer;
//! - a received Suspect update marks the target, forwards the update and
//!   arms a suspicion timer.
//!
//! Either suspicion timer deletes the member unless a Resume for the same
//! identity arrives first.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dedup_cache::DedupCache;
use crate::error::{Result, SwimError};
use crate::gossip_cache::GossipCache;
use crate::id::{random_sequence, MemberId};
use crate::membership_list::MembershipList;
use crate::network::{InboundMessage, NetworkClient, OutboundMessage};
use crate::timer::{spawn_timer, TimerTable};
use crate::wire::{decode_members, encode_members, Member, Packet, PacketType, Update, UpdateKind, MEMBER_LEN};
use crate::SwimConfig;

const INITIAL_CAPACITY: usize = 10;

pub struct MembershipService {
    config: SwimConfig,
    myself: MemberId,
    network_client: Box<dyn NetworkClient>,
    state: Mutex<ServiceState>,
    cancellation_token: CancellationToken,
}

struct ServiceState {
    members: MembershipList,
    gossip: GossipCache,
    dedup: DedupCache,
    /// Outstanding probes by sequence number, valued by the probed member.
    ping_timers: TimerTable<u16, MemberId>,
    suspicion_timers: TimerTable<MemberId, ()>,
    /// Present while a join is waiting for its `InitReply`.
    init_reply: Option<oneshot::Sender<()>>,
}

impl MembershipService {
    /// Creates the service with `myself` as the only member.
    pub fn new(config: SwimConfig,
               myself: Member,
               network_client: Box<dyn NetworkClient>) -> Arc<MembershipService> {
        let cancellation_token = CancellationToken::new();
        let mut members = MembershipList::with_capacity(INITIAL_CAPACITY);
        members.insert(myself);
        let state = ServiceState {
            members,
            gossip: GossipCache::new(),
            dedup: DedupCache::new(config.dedup_window),
            ping_timers: TimerTable::new(cancellation_token.clone()),
            suspicion_timers: TimerTable::new(cancellation_token.clone()),
            init_reply: None,
        };
        Arc::new(MembershipService {
            config,
            myself: myself.id,
            network_client,
            state: Mutex::new(state),
            cancellation_token,
        })
    }

    pub fn myself(&self) -> MemberId {
        self.myself
    }

    pub fn config(&self) -> &SwimConfig {
        &self.config
    }

    pub fn members(&self) -> Vec<Member> {
        self.lock_state().members.members().to_vec()
    }

    pub fn member(&self, id: &MemberId) -> Option<Member> {
        self.lock_state().members.retrieve(id).ok()
    }

    /// Updates still waiting to be piggybacked, with their remaining ttl.
    pub fn pending_updates(&self) -> Vec<Update> {
        self.lock_state().gossip.pending().to_vec()
    }

    /// Spawns the inbound dispatcher and the prober.
    pub fn start(self: &Arc<Self>, receiver: UnboundedReceiver<InboundMessage>) -> Vec<JoinHandle<()>> {
        vec![self.start_receive_loop(receiver), self.start_probe_loop()]
    }

    /// Stops both loops and every armed timer.
    pub fn shutdown(&self) {
        log::info!("Membership service {} shutting down", self.myself);
        self.cancellation_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Asks the configured introducer for the membership list and waits for
    /// the reply. Returns immediately when this process is the introducer.
    pub async fn join(self: &Arc<Self>) -> Result<()> {
        let introducer = match self.config.introducer {
            Some(introducer) => introducer,
            None => {
                log::info!("{} acts as introducer", self.myself);
                return Ok(());
            }
        };

        let (reply_sender, reply_receiver) = oneshot::channel();
        let myself = {
            let mut state = self.lock_state();
            state.init_reply = Some(reply_sender);
            state.members.retrieve(&self.myself)?
        };
        let mut payload = BytesMut::with_capacity(MEMBER_LEN);
        myself.encode(&mut payload);
        log::info!("Send init request to {}", introducer);
        self.send(Packet::new(PacketType::PING | PacketType::INIT_REQUEST, random_sequence(), payload.freeze()),
                  introducer);

        match tokio::time::timeout(self.config.init_timeout, reply_receiver).await {
            Ok(Ok(())) => {
                log::info!("Joined cluster via {}", introducer);
                Ok(())
            }
            _ => {
                self.lock_state().init_reply = None;
                log::error!("Init request to {} timed out", introducer);
                Err(SwimError::Timeout("init request"))
            }
        }
    }

    /// Announces that this process leaves. The update spreads on the next
    /// probes, so keep the service running for a few periods afterwards.
    pub fn leave(&self) -> Result<()> {
        let mut state = self.lock_state();
        let myself = state.members.retrieve(&self.myself)?;
        self.announce(&mut state, UpdateKind::Leave, myself);
        Ok(())
    }

    /// Handles one received datagram. Malformed input is logged and dropped.
    pub fn handle_datagram(self: &Arc<Self>, message: InboundMessage) {
        let sender = message.sender_address;
        if self.is_shutdown() {
            log::debug!("Service stopped, drop datagram from {}", sender);
            return;
        }
        let packet = match Packet::decode(message.bytes) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("Drop datagram from {}: {}", sender, err);
                return;
            }
        };
        let packet_type = packet.header.packet_type;
        log::debug!("Receive {:?} seq {} from {}", packet_type, packet.header.sequence, sender);

        let mut reply = None;
        {
            let mut state = self.lock_state();
            if packet_type.contains(PacketType::PING) {
                match self.on_ping(&mut state, &packet) {
                    Ok(ack) => reply = Some(ack),
                    Err(err) => log::warn!("Drop ping from {}: {}", sender, err),
                }
            }
            if packet_type.contains(PacketType::ACK) {
                if let Err(err) = self.on_ack(&mut state, &packet, sender) {
                    log::warn!("Drop ack from {}: {}", sender, err);
                }
            }
        }
        if let Some(ack) = reply {
            self.send(ack, sender);
        }
    }

    /// One prober round: ping the next member, carrying a gossip update if
    /// one is pending, and arm the ping timer.
    pub fn probe(self: &Arc<Self>) {
        let (target, packet) = {
            let mut state = self.lock_state();
            let target = match state.members.pick_next() {
                Some(target) => target,
                None => return,
            };
            if target.id == self.myself {
                log::debug!("Skip probing myself");
                return;
            }
            let mut sequence = random_sequence();
            while state.ping_timers.contains(&sequence) {
                sequence = random_sequence();
            }
            let packet = match state.gossip.get() {
                Ok(update) => Packet::new(PacketType::PING | update.kind.packet_type(), sequence, update.to_bytes()),
                Err(_) => Packet::new(PacketType::PING, sequence, Bytes::new()),
            };
            self.arm_ping_timer(&mut state, sequence, target.id);
            (target, packet)
        };
        log::debug!("Ping {} seq {}", target.id, packet.header.sequence);
        self.send(packet, self.address_of(&target.id));
    }

    fn on_ping(self: &Arc<Self>, state: &mut ServiceState, packet: &Packet) -> Result<Packet> {
        let packet_type = packet.header.packet_type;
        let ack_sequence = packet.header.sequence.wrapping_add(1);

        if packet_type.contains(PacketType::INIT_REQUEST) {
            let joining = Member::decode(&mut packet.payload.clone())?;
            log::info!("Init request from {}", joining.id);
            if state.members.insert(joining) {
                self.announce(state, UpdateKind::Join, joining);
            }
            log::debug!("{}", state.members);
            let payload = encode_members(state.members.members());
            return Ok(Packet::new(PacketType::ACK | PacketType::INIT_REPLY, ack_sequence, payload));
        }

        if let Some(kind) = packet_type.update_kind() {
            let update = decode_update(kind, &packet.payload)?;
            self.apply_update(state, update);
        }

        Ok(match state.gossip.get() {
            Ok(update) => Packet::new(PacketType::ACK | update.kind.packet_type(), ack_sequence, update.to_bytes()),
            Err(_) => Packet::new(PacketType::ACK, ack_sequence, Bytes::new()),
        })
    }

    fn on_ack(self: &Arc<Self>, state: &mut ServiceState, packet: &Packet, sender: SocketAddr) -> Result<()> {
        let packet_type = packet.header.packet_type;
        // acks echo the ping's sequence + 1
        let pinged = packet.header.sequence.wrapping_sub(1);
        if let Some(target) = state.ping_timers.cancel(&pinged) {
            log::debug!("Receive ack from {} for seq {}", target, pinged);
        }

        if packet_type.contains(PacketType::INIT_REPLY) {
            match state.init_reply.take() {
                Some(reply_sender) => {
                    log::info!("Receive init reply from {}", sender);
                    let _ = reply_sender.send(());
                }
                None => log::debug!("Receive init reply from {} without a pending join", sender),
            }
            for member in decode_members(packet.payload.clone()) {
                state.members.insert(member);
            }
            log::debug!("{}", state.members);
            return Ok(());
        }

        if let Some(kind) = packet_type.update_kind() {
            let update = decode_update(kind, &packet.payload)?;
            self.apply_update(state, update);
        }
        Ok(())
    }

    fn apply_update(self: &Arc<Self>, state: &mut ServiceState, update: Update) {
        if state.dedup.check_and_mark(update.update_id) {
            return;
        }
        let target = update.member.id;
        log::debug!("Apply {:?} update {:#x} for {}", update.kind, update.update_id, target);

        match update.kind {
            UpdateKind::Suspect => {
                if target == self.myself {
                    log::warn!("Suspected by the cluster, announcing resume");
                    let myself = state.members.retrieve(&self.myself)
                        .unwrap_or(update.member);
                    let resumed = Member::new(self.myself, myself.state.resumed());
                    self.announce(state, UpdateKind::Resume, resumed);
                    return;
                }
                match state.members.update(&target, update.member.state) {
                    Ok(()) => self.arm_suspicion_timer(state, target),
                    Err(err) => log::error!("Suspect update {:#x}: {}", update.update_id, err),
                }
                state.gossip.set(update);
            }
            UpdateKind::Resume => {
                if state.suspicion_timers.cancel(&target).is_some() {
                    log::info!("Member {} refuted suspicion", target);
                }
                if let Err(err) = state.members.update(&target, update.member.state) {
                    log::error!("Resume update {:#x}: {}", update.update_id, err);
                }
                state.gossip.set(update);
            }
            UpdateKind::Leave => {
                if target == self.myself {
                    log::debug!("Ignore leave update for myself");
                    return;
                }
                state.suspicion_timers.cancel(&target);
                match state.members.delete(&target) {
                    Ok(_) => log::info!("Member {} left", target),
                    Err(err) => log::error!("Leave update {:#x}: {}", update.update_id, err),
                }
                state.gossip.set(update);
            }
            UpdateKind::Join => {
                state.members.insert(update.member);
                state.gossip.set(update);
            }
        }
    }

    /// Originates an update. Its id is marked as seen so echoes are dropped.
    fn announce(&self, state: &mut ServiceState, kind: UpdateKind, member: Member) {
        let update = Update::new(kind, member, self.config.gossip_ttl);
        state.dedup.check_and_mark(update.update_id);
        log::info!("Announce {:?} for {}", kind, member.id);
        state.gossip.set(update);
    }

    fn arm_ping_timer(self: &Arc<Self>, state: &mut ServiceState, sequence: u16, target: MemberId) {
        let handle = state.ping_timers.arm(sequence, target);
        let generation = handle.generation;
        let service = Arc::clone(self);
        spawn_timer(handle, self.config.ping_timeout, move || service.on_ping_timeout(sequence, generation));
    }

    fn on_ping_timeout(self: &Arc<Self>, sequence: u16, generation: u64) {
        let mut state = self.lock_state();
        let target = match state.ping_timers.fire(&sequence, generation) {
            Some(target) => target,
            None => return,
        };
        log::warn!("Ping {} to {} timed out", sequence, target);
        if state.suspicion_timers.contains(&target) {
            log::debug!("Member {} is already suspected", target);
            return;
        }
        let member = match state.members.retrieve(&target) {
            Ok(member) => member,
            Err(_) => {
                log::debug!("Member {} was removed before its ping timed out", target);
                return;
            }
        };
        let suspected = Member::new(target, member.state.suspected());
        if let Err(err) = state.members.update(&target, suspected.state) {
            log::error!("Suspect {}: {}", target, err);
            return;
        }
        self.announce(&mut state, UpdateKind::Suspect, suspected);
        self.arm_suspicion_timer(&mut state, target);
    }

    fn arm_suspicion_timer(self: &Arc<Self>, state: &mut ServiceState, target: MemberId) {
        let handle = state.suspicion_timers.arm(target, ());
        let generation = handle.generation;
        let service = Arc::clone(self);
        spawn_timer(handle, self.config.suspicion_timeout, move || service.on_suspicion_timeout(target, generation));
    }

    fn on_suspicion_timeout(&self, target: MemberId, generation: u64) {
        let mut state = self.lock_state();
        if state.suspicion_timers.fire(&target, generation).is_none() {
            return;
        }
        log::warn!("Member {} did not refute suspicion, removing it", target);
        match state.members.delete(&target) {
            Ok(_) => log::debug!("{}", state.members),
            Err(err) => log::error!("Remove suspected {}: {}", target, err),
        }
    }

    fn start_receive_loop(self: &Arc<Self>, mut receiver: UnboundedReceiver<InboundMessage>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = service.cancellation_token.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let handler = Arc::clone(&service);
                tokio::spawn(async move { handler.handle_datagram(message) });
            }
            log::debug!("Incoming request task will be stopped");
        })
    }

    fn start_probe_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while !service.is_shutdown() {
                service.probe();
                tokio::select! {
                    biased;
                    _ = service.cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(service.config.probe_period) => {}
                }
            }
            log::debug!("Probe task will be stopped");
        })
    }

    fn send(&self, packet: Packet, target_address: SocketAddr) {
        let message = OutboundMessage { content: packet.encode(), target_address };
        if let Err(err) = self.network_client.send(message) {
            log::warn!("Send {:?} failed: {}", packet.header.packet_type, err);
        }
    }

    fn address_of(&self, id: &MemberId) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(id.ip_addr()), self.config.port)
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode_update(kind: UpdateKind, payload: &Bytes) -> Result<Update> {
    let update = Update::decode(&mut payload.clone())?;
    if update.kind != kind {
        return Err(SwimError::Malformed(format!(
            "header announces {:?}, record carries {:?}", kind, update.kind
        )));
    }
    Ok(update)
}
