use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

crate::status_enum! {
    /// Supported game types. The string form is the stable identifier used by
    /// the control surface and persisted on servers.
    GameKind, "game kind" {
        ArkAscended => "ARK_ASCENDED",
        Minecraft => "MINECRAFT",
        Terraria => "TERRARIA",
        DontStarveTogether => "DONT_STARVE_TOGETHER",
    }
}

crate::status_enum! {
    /// Role a port plays for a game server.
    PortRole, "port role" {
        Game => "game",
        /// Unreal's raw UDP socket, always one above the game port.
        Raw => "raw",
        Query => "query",
        Rcon => "rcon",
        WebMap => "web_map",
        Master => "master",
        Auth => "auth",
    }
}

impl GameKind {
    /// Multi-instance persistent-world games that can share storage as a cluster.
    pub fn supports_clustering(self) -> bool {
        matches!(self, GameKind::ArkAscended)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// 100 = one full core.
    pub cpu_percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArkAscendedConfig {
    pub session_name: String,
    #[serde(default = "default_ark_map")]
    pub map: String,
    pub admin_password: String,
    #[serde(default)]
    pub server_password: Option<String>,
    #[serde(default)]
    pub mods: Vec<u64>,
    /// Extra `[ServerSettings]` keys written to GameUserSettings.ini.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    pub resources: ResourceLimits,
}

fn default_ark_map() -> String {
    "TheIsland_WP".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinecraftConfig {
    pub version: String,
    pub server_jar_url: String,
    #[serde(default)]
    pub accept_eula: bool,
    #[serde(default)]
    pub motd: Option<String>,
    pub rcon_password: String,
    /// Extra `server.properties` entries.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub resources: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerrariaConfig {
    #[serde(default = "default_terraria_version")]
    pub version: String,
    pub world_name: String,
    /// 1 = small, 2 = medium, 3 = large.
    #[serde(default = "default_world_size")]
    pub world_size: u8,
    #[serde(default)]
    pub password: Option<String>,
    pub resources: ResourceLimits,
}

fn default_terraria_version() -> String {
    "1453".to_string()
}

fn default_world_size() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DontStarveTogetherConfig {
    pub cluster_token: String,
    pub cluster_name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pvp: bool,
    #[serde(default = "default_dst_game_mode")]
    pub game_mode: String,
    pub resources: ResourceLimits,
}

fn default_dst_game_mode() -> String {
    "survival".to_string()
}

/// Per-game server configuration, tagged by game type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "game")]
pub enum GameConfig {
    #[serde(rename = "ARK_ASCENDED")]
    ArkAscended(ArkAscendedConfig),
    #[serde(rename = "MINECRAFT")]
    Minecraft(MinecraftConfig),
    #[serde(rename = "TERRARIA")]
    Terraria(TerrariaConfig),
    #[serde(rename = "DONT_STARVE_TOGETHER")]
    DontStarveTogether(DontStarveTogetherConfig),
}

impl GameConfig {
    pub fn kind(&self) -> GameKind {
        match self {
            GameConfig::ArkAscended(_) => GameKind::ArkAscended,
            GameConfig::Minecraft(_) => GameKind::Minecraft,
            GameConfig::Terraria(_) => GameKind::Terraria,
            GameConfig::DontStarveTogether(_) => GameKind::DontStarveTogether,
        }
    }

    pub fn resources(&self) -> &ResourceLimits {
        match self {
            GameConfig::ArkAscended(c) => &c.resources,
            GameConfig::Minecraft(c) => &c.resources,
            GameConfig::Terraria(c) => &c.resources,
            GameConfig::DontStarveTogether(c) => &c.resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_tagged_by_game() {
        let raw = serde_json::json!({
            "game": "TERRARIA",
            "world_name": "island",
            "resources": { "memory_mb": 1024, "cpu_percent": 100 }
        });
        let cfg: GameConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(cfg.kind(), GameKind::Terraria);
        let GameConfig::Terraria(t) = &cfg else {
            panic!("expected terraria config");
        };
        assert_eq!(t.version, "1453");
        assert_eq!(t.world_size, 1);

        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back["game"], "TERRARIA");
    }

    #[test]
    fn unknown_game_tag_is_rejected() {
        let raw = serde_json::json!({ "game": "PONG", "resources": {} });
        assert!(serde_json::from_value::<GameConfig>(raw).is_err());
    }

    #[test]
    fn port_roles_serialize_as_map_keys() {
        let mut ports = BTreeMap::new();
        ports.insert(PortRole::Game, 7777u16);
        ports.insert(PortRole::WebMap, 8123u16);
        let json = serde_json::to_string(&ports).unwrap();
        assert_eq!(json, r#"{"game":7777,"web_map":8123}"#);
    }
}
