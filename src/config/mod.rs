use anyhow::{Context, Result};
use serde::Deserialize;

/// Complete Tether configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub entity: EntityConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub mock: MockConfig,
}

/// Entity defaults
#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    /// Attribute holding the persistent id
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_entity_cid_prefix")]
    pub cid_prefix: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_entity_cid_prefix() -> String {
    "m".to_string()
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            id_field: default_id_field(),
            cid_prefix: default_entity_cid_prefix(),
        }
    }
}

/// Group defaults
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_group_cid_prefix")]
    pub cid_prefix: String,
    /// Field of an object fetch response holding the members
    #[serde(default = "default_results_field")]
    pub results_field: String,
    /// Fetch with POST and the form as body instead of GET and a query string
    #[serde(default)]
    pub send_form_as_post: bool,
}

fn default_group_cid_prefix() -> String {
    "c".to_string()
}

fn default_results_field() -> String {
    "data".to_string()
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            cid_prefix: default_group_cid_prefix(),
            results_field: default_results_field(),
            send_form_as_post: false,
        }
    }
}

/// Request encoding
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    /// Send bodies as `model=<json>` form posts for servers without JSON support
    #[serde(default)]
    pub emulate_json: bool,
}

/// Mock transport settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockConfig {
    /// Artificial response delay
    #[serde(default)]
    pub delay_ms: u64,
}

impl TetherConfig {
    /// Apply `TETHER_*` environment overrides; unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("TETHER_EMULATE_JSON") {
            if let Ok(b) = v.parse::<bool>() {
                self.sync.emulate_json = b;
            }
        }
        if let Ok(v) = std::env::var("TETHER_MOCK_DELAY_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.mock.delay_ms = n;
            }
        }
        self
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<TetherConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: TetherConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
