use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::types::{GossipMessage, NodeId, Peer, PeerState};
use super::{Liveness, PeerResolver};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GossipService {
    pub local: Peer,
    peers: Arc<DashMap<NodeId, Peer>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    seeds: Vec<SocketAddr>,
}

impl GossipService {
    /// Binds the gossip socket. Nothing is sent until [`GossipService::start`].
    pub async fn new(
        id: NodeId,
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        seeds: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;

        let local = Peer {
            id,
            gossip_addr,
            http_addr,
            state: PeerState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let peers = Arc::new(DashMap::new());
        peers.insert(local.id.clone(), local.clone());

        Ok(Arc::new(Self {
            local,
            peers,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            seeds,
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!(
            "Starting gossip for {} on {} ({} seed(s))",
            self.local.id,
            self.local.gossip_addr,
            self.seeds.len()
        );

        self.announce().await;

        let service = self.clone();
        tokio::spawn(async move { service.ping_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.receive_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.failure_detection_loop().await });
    }

    pub fn alive_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|entry| entry.value().state == PeerState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sends our own record to every seed so they add us to their table.
    async fn announce(&self) {
        let msg = GossipMessage::Join {
            peer: self.current_self(),
        };

        for seed in &self.seeds {
            if *seed == self.local.gossip_addr {
                continue;
            }
            self.send_to(&msg, *seed).await;
        }
    }

    fn current_self(&self) -> Peer {
        let mut me = self.local.clone();
        me.incarnation = self.incarnation.load(Ordering::SeqCst);
        me
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let targets: Vec<Peer> = self
                .alive_peers()
                .into_iter()
                .filter(|peer| peer.id != self.local.id)
                .collect();

            if targets.is_empty() {
                // alone, possibly because the seed came up after us
                self.announce().await;
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..targets.len());
                targets[idx].gossip_addr
            };

            let msg = GossipMessage::Ping {
                from: self.local.id.clone(),
                incarnation: self.incarnation.load(Ordering::SeqCst),
            };
            self.send_to(&msg, target).await;
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => self.handle_message(msg, src).await,
                    Err(e) => tracing::warn!("Dropping malformed gossip from {}: {}", src, e),
                },
                Err(e) => {
                    tracing::error!("Gossip receive failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) {
        match msg {
            GossipMessage::Join { peer } => {
                tracing::info!("Peer {} joined via {}", peer.id, src);
                let from = peer.id.clone();
                self.merge(peer);
                self.reply_ack(&from, src).await;
            }
            GossipMessage::Ping { from, incarnation } => {
                self.touch(&from, incarnation);
                self.reply_ack(&from, src).await;
            }
            GossipMessage::Ack {
                from,
                incarnation,
                peers,
            } => {
                self.touch(&from, incarnation);
                for peer in peers {
                    self.merge(peer);
                }
            }
            GossipMessage::Suspect { id, incarnation } => self.handle_suspect(id, incarnation).await,
            GossipMessage::Alive { id, incarnation } => {
                if let Some(mut peer) = self.peers.get_mut(&id)
                    && incarnation >= peer.incarnation
                {
                    peer.state = PeerState::Alive;
                    peer.incarnation = incarnation;
                    peer.last_seen = Some(Instant::now());
                }
            }
        }
    }

    async fn reply_ack(&self, to: &NodeId, src: SocketAddr) {
        let peers: Vec<Peer> = self
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let reply = GossipMessage::Ack {
            from: self.local.id.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            peers,
        };

        tracing::trace!("Acking {}", to);
        self.send_to(&reply, src).await;
    }

    /// Direct contact: the sender is alive whatever we believed before.
    fn touch(&self, id: &NodeId, incarnation: u64) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.state = PeerState::Alive;
            peer.incarnation = peer.incarnation.max(incarnation);
            peer.last_seen = Some(Instant::now());
        }
    }

    /// Folds a second-hand peer record into the table; higher incarnation wins.
    fn merge(&self, mut incoming: Peer) {
        if incoming.id == self.local.id {
            return;
        }

        match self.peers.get_mut(&incoming.id) {
            Some(mut existing) => {
                if incoming.incarnation > existing.incarnation {
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.http_addr = incoming.http_addr;
                    existing.gossip_addr = incoming.gossip_addr;
                    existing.last_seen = Some(Instant::now());
                } else if existing.state == PeerState::Dead && incoming.state == PeerState::Alive {
                    tracing::debug!("Ignoring stale alive record for dead peer {}", incoming.id);
                }
            }
            None => {
                tracing::info!("Discovered peer {} at {}", incoming.id, incoming.gossip_addr);
                incoming.last_seen = Some(Instant::now());
                self.peers.insert(incoming.id.clone(), incoming);
            }
        }
    }

    async fn handle_suspect(&self, id: NodeId, incarnation: u64) {
        if id == self.local.id {
            let refuted = self.incarnation.fetch_max(incarnation + 1, Ordering::SeqCst).max(incarnation + 1);
            tracing::info!("Refuting suspicion about ourselves (inc={})", refuted);
            self.broadcast(GossipMessage::Alive { id, incarnation: refuted }).await;
            return;
        }

        if let Some(mut peer) = self.peers.get_mut(&id)
            && incarnation >= peer.incarnation
            && peer.state == PeerState::Alive
        {
            tracing::info!("Peer {} suspected", id);
            peer.state = PeerState::Suspect;
            peer.incarnation = incarnation;
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut suspicions = Vec::new();

            for mut entry in self.peers.iter_mut() {
                let peer = entry.value_mut();
                if peer.id == self.local.id {
                    continue;
                }

                let Some(last_seen) = peer.last_seen else {
                    peer.last_seen = Some(now);
                    continue;
                };
                let silent = now.duration_since(last_seen);

                match peer.state {
                    PeerState::Alive if silent > SUSPECT_TIMEOUT => {
                        tracing::warn!("Peer {} suspected (silent for {:?})", peer.id, silent);
                        peer.state = PeerState::Suspect;
                        suspicions.push(GossipMessage::Suspect {
                            id: peer.id.clone(),
                            incarnation: peer.incarnation,
                        });
                    }
                    PeerState::Suspect if silent > DEAD_TIMEOUT => {
                        tracing::warn!("Peer {} declared dead", peer.id);
                        peer.state = PeerState::Dead;
                    }
                    _ => {}
                }
            }

            for msg in suspicions {
                self.broadcast(msg).await;
            }
        }
    }

    async fn broadcast(&self, msg: GossipMessage) {
        let targets: Vec<SocketAddr> = self
            .alive_peers()
            .into_iter()
            .filter(|peer| peer.id != self.local.id)
            .map(|peer| peer.gossip_addr)
            .collect();

        for target in targets {
            self.send_to(&msg, target).await;
        }
    }

    async fn send_to(&self, msg: &GossipMessage, target: SocketAddr) {
        match bincode::serialize(msg) {
            Ok(encoded) => {
                if let Err(e) = self.socket.send_to(&encoded, target).await {
                    tracing::warn!("Gossip send to {} failed: {}", target, e);
                }
            }
            Err(e) => tracing::error!("Failed to encode gossip message: {}", e),
        }
    }
}

impl Liveness for GossipService {
    fn online_node_ids(&self) -> HashSet<NodeId> {
        self.alive_peers().into_iter().map(|peer| peer.id).collect()
    }
}

impl PeerResolver for GossipService {
    fn http_addr(&self, id: &NodeId) -> Option<SocketAddr> {
        self.peers
            .get(id)
            .filter(|peer| peer.state != PeerState::Dead)
            .map(|peer| peer.http_addr)
    }
}
