//! Conflict-free port sets per machine.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use ember_core::{GameKind, Machine, PortAllocation, PortRole};
use uuid::Uuid;

use crate::{
    error::ProvisionError,
    executor::{Connection, RemoteExecutor},
    shell::RemoteCommand,
    store::Store,
};

/// Offset `k` of a plan takes `base + k * stride` for every role. A stride
/// above 1 leaves room for ports a role drags along with it, and those
/// neighbours are listed as roles of their own so other games cannot take
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub role: PortRole,
    pub base: u16,
    pub stride: u16,
}

/// Ports a game needs and where to start looking for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPlan {
    specs: Vec<PortSpec>,
}

const fn spec(role: PortRole, base: u16, stride: u16) -> PortSpec {
    PortSpec { role, base, stride }
}

impl PortPlan {
    pub fn for_game(kind: GameKind) -> Self {
        let specs = match kind {
            // The server also binds game + 1, so game ports advance by two.
            GameKind::ArkAscended => vec![
                spec(PortRole::Game, 7777, 2),
                spec(PortRole::Raw, 7778, 2),
                spec(PortRole::Query, 27015, 1),
                spec(PortRole::Rcon, 27020, 1),
            ],
            GameKind::Minecraft => vec![
                spec(PortRole::Game, 25565, 1),
                spec(PortRole::Rcon, 25575, 1),
                spec(PortRole::WebMap, 8123, 1),
            ],
            GameKind::Terraria => vec![spec(PortRole::Game, 7777, 1)],
            GameKind::DontStarveTogether => vec![
                spec(PortRole::Game, 10999, 1),
                spec(PortRole::Master, 27016, 1),
                spec(PortRole::Auth, 8766, 1),
            ],
        };
        Self { specs }
    }

    pub fn specs(&self) -> &[PortSpec] {
        &self.specs
    }

    /// Candidate set for offset `k`, or `None` once any port would pass 65535.
    pub fn candidate(&self, k: u32, preferred_base: Option<u16>) -> Option<BTreeMap<PortRole, u16>> {
        let mut out = BTreeMap::new();
        for s in &self.specs {
            let base = match (s.role, preferred_base) {
                (PortRole::Game, Some(p)) => p,
                (PortRole::Raw, Some(p)) => p.checked_add(1)?,
                _ => s.base,
            };
            let port = u32::from(base) + k.checked_mul(u32::from(s.stride))?;
            out.insert(s.role, u16::try_from(port).ok()?);
        }
        Some(out)
    }
}

fn distinct(ports: &BTreeMap<PortRole, u16>) -> bool {
    let set: BTreeSet<u16> = ports.values().copied().collect();
    set.len() == ports.len()
}

pub struct PortAllocator {
    store: Arc<dyn Store>,
    executor: Arc<dyn RemoteExecutor>,
    max_attempts: u32,
    probe_timeout: Duration,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl PortAllocator {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn RemoteExecutor>,
        max_attempts: u32,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            max_attempts: max_attempts.max(1),
            probe_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, machine_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(machine_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Reserves ports for `server_id` on `machine_id`. Returns the existing
    /// allocation unchanged when the server already holds one there.
    pub async fn allocate(
        &self,
        machine_id: Uuid,
        server_id: Uuid,
        kind: GameKind,
        preferred_base: Option<u16>,
    ) -> Result<PortAllocation, ProvisionError> {
        let lock = self.lock_for(machine_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.get_port_allocation(server_id).await? {
            if existing.machine_id == machine_id {
                return Ok(existing);
            }
            return Err(ProvisionError::ResourceConflict(format!(
                "server {server_id} already holds ports on machine {}",
                existing.machine_id
            )));
        }

        let plan = PortPlan::for_game(kind);
        match self.probe_and_insert(&plan, machine_id, server_id, preferred_base).await {
            Err(ProvisionError::ResourceConflict(msg)) => {
                // Another control-plane process won the rows; probe again
                // against the fresh state.
                tracing::warn!(%machine_id, %server_id, reason = %msg, "port allocation raced; retrying");
                self.probe_and_insert(&plan, machine_id, server_id, preferred_base)
                    .await
            }
            other => other,
        }
    }

    async fn probe_and_insert(
        &self,
        plan: &PortPlan,
        machine_id: Uuid,
        server_id: Uuid,
        preferred_base: Option<u16>,
    ) -> Result<PortAllocation, ProvisionError> {
        let held: BTreeSet<u16> = self
            .store
            .list_port_allocations(machine_id)
            .await?
            .iter()
            .flat_map(|a| a.ports.values().copied())
            .collect();

        for k in 0..self.max_attempts {
            let Some(ports) = plan.candidate(k, preferred_base) else {
                break;
            };
            if !distinct(&ports) || ports.values().any(|p| held.contains(p)) {
                continue;
            }
            let allocation = PortAllocation {
                machine_id,
                server_id,
                ports,
                created_at: Utc::now(),
            };
            self.store.insert_port_allocation(&allocation).await?;
            tracing::info!(
                %machine_id,
                %server_id,
                ports = ?allocation.ports,
                offset = k,
                "ports allocated"
            );
            return Ok(allocation);
        }

        Err(ProvisionError::NoPortsAvailable {
            machine_id,
            attempts: self.max_attempts,
        })
    }

    /// Releases the server's ports. Idempotent.
    pub async fn deallocate(&self, server_id: Uuid) -> Result<Option<PortAllocation>, ProvisionError> {
        let removed = self.store.delete_port_allocation(server_id).await?;
        if let Some(a) = &removed {
            tracing::info!(machine_id = %a.machine_id, %server_id, ports = ?a.ports, "ports released");
        }
        Ok(removed)
    }

    /// Live check on the machine that nothing is bound to `port`. A
    /// secondary guard; the persisted allocations stay authoritative.
    pub async fn check_availability(
        &self,
        machine: &Machine,
        port: u16,
    ) -> Result<bool, ProvisionError> {
        let probe = RemoteCommand::new("ss").args(["-Hlntu", "sport", "=", &format!(":{port}")]);
        let out = self
            .executor
            .execute(&Connection::for_machine(machine), &probe.into(), self.probe_timeout)
            .await?
            .check("check port availability")?;
        Ok(out.stdout.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, seeded_store};

    fn allocator(store: Arc<dyn Store>, executor: Arc<FakeExecutor>) -> PortAllocator {
        PortAllocator::new(store, executor, 200, Duration::from_secs(5))
    }

    #[test]
    fn ark_plan_uses_stride_two_for_game_port() {
        let plan = PortPlan::for_game(GameKind::ArkAscended);
        let c = plan.candidate(1, None).unwrap();
        assert_eq!(c[&PortRole::Game], 7779);
        assert_eq!(c[&PortRole::Raw], 7780);
        assert_eq!(c[&PortRole::Query], 27016);
        assert_eq!(c[&PortRole::Rcon], 27021);
    }

    #[test]
    fn candidate_stops_at_u16_max() {
        let plan = PortPlan::for_game(GameKind::Terraria);
        assert!(plan.candidate(0, Some(65535)).is_some());
        assert!(plan.candidate(1, Some(65535)).is_none());
    }

    #[tokio::test]
    async fn first_ark_on_empty_machine_gets_default_ports() {
        let (store, m) = seeded_store().await;
        let ports = allocator(store, FakeExecutor::new());
        let a = ports
            .allocate(m.id, Uuid::new_v4(), GameKind::ArkAscended, None)
            .await
            .unwrap();
        assert_eq!(
            a.ports,
            BTreeMap::from([
                (PortRole::Game, 7777),
                (PortRole::Raw, 7778),
                (PortRole::Query, 27015),
                (PortRole::Rcon, 27020),
            ])
        );
    }

    #[tokio::test]
    async fn second_ark_on_same_machine_is_disjoint() {
        let (store, m) = seeded_store().await;
        let ports = allocator(store, FakeExecutor::new());
        let a = ports
            .allocate(m.id, Uuid::new_v4(), GameKind::ArkAscended, None)
            .await
            .unwrap();
        let b = ports
            .allocate(m.id, Uuid::new_v4(), GameKind::ArkAscended, None)
            .await
            .unwrap();
        assert!(!a.overlaps(&b));
        assert_eq!(b.game_port(), Some(7779));
    }

    #[tokio::test]
    async fn games_sharing_a_base_port_do_not_collide() {
        let (store, m) = seeded_store().await;
        let ports = allocator(store, FakeExecutor::new());
        let ark = ports
            .allocate(m.id, Uuid::new_v4(), GameKind::ArkAscended, None)
            .await
            .unwrap();
        let terraria = ports
            .allocate(m.id, Uuid::new_v4(), GameKind::Terraria, None)
            .await
            .unwrap();
        assert!(!ark.overlaps(&terraria));
        // 7778 is ARK's raw socket.
        assert_eq!(terraria.game_port(), Some(7779));
    }

    #[tokio::test]
    async fn allocate_is_idempotent_per_server() {
        let (store, m) = seeded_store().await;
        let ports = allocator(store, FakeExecutor::new());
        let server = Uuid::new_v4();
        let a = ports
            .allocate(m.id, server, GameKind::Minecraft, None)
            .await
            .unwrap();
        let b = ports
            .allocate(m.id, server, GameKind::Minecraft, None)
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn release_then_reallocate_returns_same_set() {
        let (store, m) = seeded_store().await;
        let ports = allocator(store, FakeExecutor::new());
        let server = Uuid::new_v4();
        let first = ports
            .allocate(m.id, server, GameKind::DontStarveTogether, None)
            .await
            .unwrap();
        assert!(ports.deallocate(server).await.unwrap().is_some());
        assert!(ports.deallocate(server).await.unwrap().is_none());
        let again = ports
            .allocate(m.id, Uuid::new_v4(), GameKind::DontStarveTogether, None)
            .await
            .unwrap();
        assert_eq!(first.ports, again.ports);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_are_pairwise_disjoint() {
        let (store, m) = seeded_store().await;
        let ports = Arc::new(allocator(store, FakeExecutor::new()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ports = ports.clone();
            let machine_id = m.id;
            handles.push(tokio::spawn(async move {
                ports
                    .allocate(machine_id, Uuid::new_v4(), GameKind::ArkAscended, None)
                    .await
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.push(h.await.unwrap().unwrap());
        }
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a.ports, b.ports);
            }
        }
    }

    #[tokio::test]
    async fn exhausted_probe_budget_reports_no_ports() {
        let (store, m) = seeded_store().await;
        let ports = PortAllocator::new(store, FakeExecutor::new(), 1, Duration::from_secs(1));
        ports
            .allocate(m.id, Uuid::new_v4(), GameKind::Terraria, None)
            .await
            .unwrap();
        let err = ports
            .allocate(m.id, Uuid::new_v4(), GameKind::Terraria, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NoPortsAvailable { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn live_probe_reads_listening_sockets() {
        let (store, m) = seeded_store().await;
        let exec = FakeExecutor::new();
        let ports = allocator(store, exec.clone());
        assert!(ports.check_availability(&m, 7777).await.unwrap());
        exec.ports_listening();
        assert!(!ports.check_availability(&m, 7777).await.unwrap());
        assert!(exec.commands()[0].contains("sport = :7777"));
    }
}
