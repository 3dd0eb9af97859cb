//! Scripted executor and fixtures shared by unit tests.

use std::{sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use ember_core::{
    Agent, AgentStatus, ArkAscendedConfig, GameConfig, InstallState, Machine, MachineStatus,
    MinecraftConfig, ResourceLimits, Server, ServerStatus,
};
use uuid::Uuid;

use crate::{
    error::ProvisionError,
    executor::{CommandOutput, Connection, RemoteExecutor},
    shell::RemoteScript,
    store::{MemoryStore, Store},
};

#[derive(Debug, Clone)]
pub enum Scripted {
    Exit { code: i32, stdout: String, stderr: String },
    Timeout,
    Unreachable,
}

struct Rule {
    needle: String,
    reply: Scripted,
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

/// Records every rendered script and answers from rules matched by
/// substring. Later rules take precedence; unmatched commands exit 0.
#[derive(Default)]
pub struct FakeExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, needle: &str, reply: Scripted, remaining: Option<usize>) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            reply,
            remaining,
        });
    }

    pub fn reply(&self, needle: &str, code: i32, stdout: &str) {
        self.push(
            needle,
            Scripted::Exit {
                code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
            None,
        );
    }

    pub fn fail(&self, needle: &str, code: i32, stderr: &str) {
        self.push(
            needle,
            Scripted::Exit {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
            None,
        );
    }

    pub fn timeout_on(&self, needle: &str) {
        self.push(needle, Scripted::Timeout, None);
    }

    pub fn unreachable_times(&self, needle: &str, times: usize) {
        self.push(needle, Scripted::Unreachable, Some(times));
    }

    /// Makes every port probe report a listening socket.
    pub fn ports_listening(&self) {
        self.reply("ss -Hlntu", 0, "udp UNCONN 0 0 0.0.0.0:7777 0.0.0.0:*");
    }

    /// Makes readiness probes see the service's socket; allocation probes
    /// still find ports free.
    pub fn service_ready(&self) {
        self.reply(
            "ss -Hlntup",
            0,
            "tcp LISTEN 0 50 *:25565 *:* users:((\"java\",pid=4242,fd=40))",
        );
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute_with_stdin(
        &self,
        conn: &Connection,
        script: &RemoteScript,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput, ProvisionError> {
        let command = script.render();
        self.calls.lock().unwrap().push(Call {
            command: command.clone(),
            stdin,
        });

        let reply = {
            let mut rules = self.rules.lock().unwrap();
            let hit = rules.iter_mut().rev().find(|r| {
                command.contains(&r.needle) && r.remaining.is_none_or(|n| n > 0)
            });
            hit.map(|r| {
                if let Some(n) = r.remaining.as_mut() {
                    *n -= 1;
                }
                r.reply.clone()
            })
        };

        match reply {
            None => Ok(CommandOutput::default()),
            Some(Scripted::Exit {
                code,
                stdout,
                stderr,
            }) => Ok(CommandOutput {
                exit_code: code,
                stdout,
                stderr,
            }),
            Some(Scripted::Timeout) => Err(ProvisionError::Timeout {
                host: conn.host.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Some(Scripted::Unreachable) => Err(ProvisionError::Connectivity {
                host: conn.host.clone(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

pub fn machine() -> Machine {
    let now = Utc::now();
    Machine {
        id: Uuid::new_v4(),
        name: "fra-01".to_string(),
        address: "10.0.0.5".to_string(),
        ssh_port: 22,
        ssh_user: "ember".to_string(),
        ssh_key_ref: "fleet_ed25519".to_string(),
        status: MachineStatus::Online,
        created_at: now,
        updated_at: now,
    }
}

pub fn agent(machine_id: Uuid) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        machine_id,
        status: AgentStatus::Online,
        last_heartbeat: Some(Utc::now()),
        capabilities: vec!["systemd".to_string()],
        version: Some("0.1.0".to_string()),
        last_error: None,
        created_at: Utc::now(),
    }
}

pub fn minecraft_config() -> GameConfig {
    GameConfig::Minecraft(MinecraftConfig {
        version: "1.21.1".to_string(),
        server_jar_url: "https://piston-data.mojang.com/v1/objects/abc/server.jar".to_string(),
        accept_eula: true,
        motd: Some("hello".to_string()),
        rcon_password: "hunter2hunter2".to_string(),
        properties: Default::default(),
        resources: ResourceLimits {
            memory_mb: 4096,
            cpu_percent: 200,
        },
    })
}

pub fn ark_config() -> GameConfig {
    GameConfig::ArkAscended(ArkAscendedConfig {
        session_name: "Ember Island".to_string(),
        map: "TheIsland_WP".to_string(),
        admin_password: "correct-horse".to_string(),
        server_password: None,
        mods: Vec::new(),
        settings: Default::default(),
        resources: ResourceLimits {
            memory_mb: 16384,
            cpu_percent: 400,
        },
    })
}

pub fn server(machine_id: Uuid, configuration: GameConfig) -> Server {
    let now = Utc::now();
    Server {
        id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        name: "survival".to_string(),
        game: configuration.kind(),
        status: ServerStatus::Offline,
        install_state: InstallState::NotInstalled,
        machine_id,
        agent_id: None,
        cluster_id: None,
        port: None,
        max_players: 10,
        configuration,
        created_at: now,
        updated_at: now,
    }
}

/// A memory store seeded with one machine.
pub async fn seeded_store() -> (Arc<MemoryStore>, Machine) {
    let store = Arc::new(MemoryStore::new());
    let m = machine();
    store.insert_machine(&m).await.unwrap();
    (store, m)
}
