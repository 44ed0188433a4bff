use super::PeerStore;
use crate::error::OxideError;
use crate::types::{PeerNode, PeerServiceSummary};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::net::UdpSocket;
use uuid::Uuid;

/// Datagram broadcast every discovery tick, advertising this node's
/// capabilities and load to the rest of the LAN.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PresenceDatagram {
    node_id: String,
    hostname: String,
    port: u16,
    services: HashMap<String, PeerServiceSummary>,
    cpu_percent: f32,
    memory_percent: f32,
    active_tasks: u32,
    total_tasks: u64,
    version: String,
    features: Vec<String>,
}

/// Wire envelope every discovery datagram is wrapped in, so a node can
/// ignore traffic on the port that isn't ours (or a future envelope
/// type) without trying to decode it as a presence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DiscoveryEnvelope {
    OxideNode { node: PresenceDatagram },
}

/// Three-task shape mirroring `original_source/cluster/coordinator.py`:
/// broadcast presence, listen for peers, sweep for staleness. The
/// `DashMap` is the live in-memory view used for routing/delegation
/// decisions; `PeerStore` is the restart-durability layer.
pub struct ClusterCoordinator {
    node_id: String,
    hostname: String,
    port: u16,
    discovery_interval: Duration,
    peers: DashMap<String, PeerNode>,
    store: PeerStore,
    active_tasks: AtomicU32,
    total_tasks: AtomicU64,
    http: reqwest::Client,
}

impl ClusterCoordinator {
    pub fn new(port: u16, discovery_interval: Duration, store: PeerStore) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            hostname: hostname_or_unknown(),
            port,
            discovery_interval,
            peers: DashMap::new(),
            store,
            active_tasks: AtomicU32::new(0),
            total_tasks: AtomicU64::new(0),
            http: reqwest::Client::new(),
        }
    }

    /// Loads any peers persisted from a previous run (excluding our
    /// own node id) into the live map before spawning the background
    /// tasks.
    pub fn seed_from_store(&self) -> Result<(), OxideError> {
        for peer in self.store.list()? {
            if peer.node_id != self.node_id {
                self.peers.insert(peer.node_id.clone(), peer);
            }
        }
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn record_task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        self.total_tasks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_task_finished(&self) {
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    fn local_presence(&self, services: &HashMap<String, PeerServiceSummary>) -> PresenceDatagram {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        PresenceDatagram {
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            services: services.clone(),
            cpu_percent: sys.global_cpu_usage(),
            memory_percent: if sys.total_memory() > 0 {
                sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0
            } else {
                0.0
            },
            active_tasks: self.active_tasks.load(Ordering::SeqCst),
            total_tasks: self.total_tasks.load(Ordering::SeqCst),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec!["broadcast_all".to_string(), "delegation".to_string()],
        }
    }

    /// Spawns the broadcast, listen, and health-sweep tasks. Returns
    /// immediately; the tasks run for the lifetime of the runtime.
    pub fn spawn(self: Arc<Self>, services: HashMap<String, PeerServiceSummary>) -> Result<(), OxideError> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", self.port))
            .map_err(|e| OxideError::Config(format!("binding cluster discovery port {}: {}", self.port, e)))?;
        socket.set_nonblocking(true).map_err(|e| OxideError::Config(e.to_string()))?;
        socket.set_broadcast(true).map_err(|e| OxideError::Config(e.to_string()))?;
        let socket = Arc::new(UdpSocket::from_std(socket).map_err(|e| OxideError::Config(e.to_string()))?);

        self.clone().spawn_broadcast(Arc::clone(&socket), services);
        self.clone().spawn_listen(Arc::clone(&socket));
        self.clone().spawn_health_sweep();
        Ok(())
    }

    fn spawn_broadcast(self: Arc<Self>, socket: Arc<UdpSocket>, services: HashMap<String, PeerServiceSummary>) {
        let interval = self.discovery_interval;
        let port = self.port;
        tokio::spawn(async move {
            loop {
                let datagram = self.local_presence(&services);
                let envelope = DiscoveryEnvelope::OxideNode { node: datagram };
                if let Ok(payload) = serde_json::to_vec(&envelope) {
                    let _ = socket.send_to(&payload, ("255.255.255.255", port)).await;
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    fn spawn_listen(self: Arc<Self>, socket: Arc<UdpSocket>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let Ok((len, addr)) = socket.recv_from(&mut buf).await else { continue };
                let Ok(envelope) = serde_json::from_slice::<DiscoveryEnvelope>(&buf[..len]) else { continue };
                let DiscoveryEnvelope::OxideNode { node: datagram } = envelope;
                if datagram.node_id == self.node_id {
                    continue;
                }
                let now = Utc::now();
                let first_seen = self.peers.get(&datagram.node_id).map(|p| p.first_seen).unwrap_or(now);
                let peer = PeerNode {
                    node_id: datagram.node_id.clone(),
                    hostname: datagram.hostname,
                    ip_address: addr.ip().to_string(),
                    port: datagram.port,
                    services: datagram.services,
                    cpu_percent: datagram.cpu_percent,
                    memory_percent: datagram.memory_percent,
                    active_tasks: datagram.active_tasks,
                    total_tasks: datagram.total_tasks,
                    last_seen: now,
                    healthy: true,
                    enabled: true,
                    version: Some(datagram.version),
                    features: datagram.features,
                    first_seen,
                };
                self.peers.insert(peer.node_id.clone(), peer.clone());
                let _ = self.store.upsert(&peer);
            }
        });
    }

    fn spawn_health_sweep(self: Arc<Self>) {
        let interval = self.discovery_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut stale = Vec::new();
                for mut entry in self.peers.iter_mut() {
                    let missed = entry.missed_broadcasts(interval.as_secs().max(1));
                    if missed > 6.0 {
                        stale.push(entry.node_id.clone());
                    } else if missed > 3.0 {
                        entry.healthy = false;
                    }
                }
                for node_id in stale {
                    self.peers.remove(&node_id);
                    let _ = self.store.delete(&node_id);
                    tracing::warn!(node_id = %node_id, "peer pruned after prolonged silence");
                }
            }
        });
    }

    /// Candidates = this node itself (when `local_healthy`) plus any
    /// healthy, enabled peer — filtered to peers advertising
    /// `required_service` when one is given; an absent requirement
    /// means every enabled peer qualifies. Score:
    /// `(cpu+mem)/2 + 10*active_tasks`, lower wins.
    pub fn select_best_node(&self, local_healthy: bool, required_service: Option<&str>) -> Option<String> {
        let mut best: Option<(String, f64)> = if local_healthy {
            Some((self.node_id.clone(), self.local_load_score()))
        } else {
            None
        };

        for peer in self.peers.iter() {
            if !peer.healthy || !peer.enabled {
                continue;
            }
            if let Some(service) = required_service {
                if !peer.services.contains_key(service) {
                    continue;
                }
            }
            let score = peer.load_score();
            let replace = match &best {
                Some((_, current)) => score < *current,
                None => true,
            };
            if replace {
                best = Some((peer.node_id.clone(), score));
            }
        }

        best.map(|(id, _)| id)
    }

    fn local_load_score(&self) -> f64 {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu = sys.global_cpu_usage() as f64;
        let memory = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };
        (cpu + memory) / 2.0 + 10.0 * self.active_tasks.load(Ordering::SeqCst) as f64
    }

    pub async fn delegate(&self, node_id: &str, prompt: &str, required_service: &str) -> Result<String, OxideError> {
        let peer = self
            .peers
            .get(node_id)
            .ok_or_else(|| OxideError::Unavailable(format!("unknown peer {}", node_id)))?;
        let url = format!("http://{}:{}/api/tasks/execute", peer.ip_address, peer.port);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "prompt": prompt, "preferred_service": required_service }))
            .timeout(Duration::from_secs(300))
            .send()
            .await
            .map_err(|e| OxideError::Unavailable(format!("delegation to {}: {}", node_id, e)))?;

        if !response.status().is_success() {
            return Err(OxideError::Protocol {
                service: node_id.to_string(),
                detail: format!("http {}", response.status()),
            });
        }
        response
            .text()
            .await
            .map_err(|e| OxideError::Protocol { service: node_id.to_string(), detail: e.to_string() })
    }

    pub fn enable_node(&self, node_id: &str) -> Result<(), OxideError> {
        if let Some(mut peer) = self.peers.get_mut(node_id) {
            peer.enabled = true;
        }
        self.store.set_enabled(node_id, true)
    }

    pub fn disable_node(&self, node_id: &str) -> Result<(), OxideError> {
        if let Some(mut peer) = self.peers.get_mut(node_id) {
            peer.enabled = false;
        }
        self.store.set_enabled(node_id, false)
    }

    /// Read-only diagnostic: this node plus the healthy peer count,
    /// ambient observability kept from the original (not excluded by
    /// any Non-goal).
    pub fn cluster_status(&self) -> ClusterStatus {
        let healthy = self.peers.iter().filter(|p| p.healthy).count();
        ClusterStatus {
            local_node_id: self.node_id.clone(),
            peer_count: self.peers.len(),
            healthy_peer_count: healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub local_node_id: String,
    pub peer_count: usize,
    pub healthy_peer_count: usize,
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (Arc<ClusterCoordinator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path().join("peers.db")).unwrap();
        (Arc::new(ClusterCoordinator::new(0, Duration::from_secs(30), store)), dir)
    }

    #[test]
    fn select_best_node_prefers_lowest_load() {
        let (coordinator, _dir) = coordinator();
        let mut services = HashMap::new();
        services.insert(
            "gemini".to_string(),
            PeerServiceSummary { kind: crate::types::ServiceKind::OpenAiHttp, models: vec![], capabilities: vec![], base_url: None },
        );
        let now = Utc::now();
        coordinator.peers.insert(
            "busy".to_string(),
            PeerNode {
                node_id: "busy".to_string(), hostname: "h".into(), ip_address: "10.0.0.1".into(), port: 1,
                services: services.clone(), cpu_percent: 90.0, memory_percent: 90.0, active_tasks: 5, total_tasks: 0,
                last_seen: now, healthy: true, enabled: true, version: None, features: vec![], first_seen: now,
            },
        );
        coordinator.peers.insert(
            "idle".to_string(),
            PeerNode {
                node_id: "idle".to_string(), hostname: "h".into(), ip_address: "10.0.0.2".into(), port: 1,
                services, cpu_percent: 5.0, memory_percent: 5.0, active_tasks: 0, total_tasks: 0,
                last_seen: now, healthy: true, enabled: true, version: None, features: vec![], first_seen: now,
            },
        );
        assert_eq!(coordinator.select_best_node(false, Some("gemini")), Some("idle".to_string()));
    }

    #[test]
    fn disabled_peer_is_not_a_candidate() {
        let (coordinator, _dir) = coordinator();
        let now = Utc::now();
        let mut services = HashMap::new();
        services.insert(
            "gemini".to_string(),
            PeerServiceSummary { kind: crate::types::ServiceKind::OpenAiHttp, models: vec![], capabilities: vec![], base_url: None },
        );
        coordinator.peers.insert(
            "disabled".to_string(),
            PeerNode {
                node_id: "disabled".to_string(), hostname: "h".into(), ip_address: "10.0.0.1".into(), port: 1,
                services, cpu_percent: 1.0, memory_percent: 1.0, active_tasks: 0, total_tasks: 0,
                last_seen: now, healthy: true, enabled: false, version: None, features: vec![], first_seen: now,
            },
        );
        assert_eq!(coordinator.select_best_node(false, Some("gemini")), None);
    }

    #[test]
    fn local_node_is_a_candidate_when_healthy() {
        let (coordinator, _dir) = coordinator();
        assert_eq!(coordinator.select_best_node(true, None), Some(coordinator.node_id().to_string()));
    }

    #[test]
    fn required_service_filter_is_optional() {
        let (coordinator, _dir) = coordinator();
        let now = Utc::now();
        coordinator.peers.insert(
            "no-services".to_string(),
            PeerNode {
                node_id: "no-services".to_string(), hostname: "h".into(), ip_address: "10.0.0.3".into(), port: 1,
                services: HashMap::new(), cpu_percent: 1.0, memory_percent: 1.0, active_tasks: 0, total_tasks: 0,
                last_seen: now, healthy: true, enabled: true, version: None, features: vec![], first_seen: now,
            },
        );
        assert_eq!(coordinator.select_best_node(false, None), Some("no-services".to_string()));
    }
}
