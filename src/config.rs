//! Persistent server profile configuration model and defaults.

use std::path::PathBuf;

use log::warn;

/// Root configuration persisted to `servers.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ServersConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// One configured Subsonic-family server.
///
/// Passwords are never stored here; they live in the OS keyring under the
/// server name (see `server_keyring`).
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ServerConfig {
    /// User-visible name, also used as the keyring entry and cover cache
    /// directory name.
    pub name: String,
    /// Base URL, e.g. `https://music.example.com`.
    pub url: String,
    pub username: String,
    /// Token authentication (`t`+`s`) when true, obfuscated password (`p`)
    /// otherwise. Old Subsonic releases only understand the latter.
    #[serde(default = "default_true")]
    pub use_token_auth: bool,
    /// Connect and refresh indexes automatically on startup.
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_true() -> bool {
    true
}

/// Returns the path of `servers.toml` inside the user config directory.
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("subtide").join("servers.toml"))
}

/// Loads the server list, falling back to defaults on absence or parse error.
pub fn load_servers_config() -> ServersConfig {
    let Some(path) = config_file_path() else {
        warn!("No config directory available, using default server config");
        return ServersConfig::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                ServersConfig::default()
            }
        },
        Err(_) => ServersConfig::default(),
    }
}

/// Saves the server list, creating the config directory if needed.
pub fn save_servers_config(config: &ServersConfig) -> Result<(), String> {
    let path = config_file_path().ok_or_else(|| "no config directory available".to_string())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create config directory: {err}"))?;
    }
    let contents =
        toml::to_string(config).map_err(|err| format!("failed to serialize config: {err}"))?;
    std::fs::write(&path, contents).map_err(|err| format!("failed to write config: {err}"))
}

/// Inserts or updates a server entry by name.
pub fn upsert_server_config(config: &mut ServersConfig, entry: ServerConfig) {
    let url = entry.url.trim().trim_end_matches('/').to_string();
    let entry = ServerConfig { url, ..entry };
    if let Some(existing) = config
        .servers
        .iter_mut()
        .find(|server| server.name == entry.name)
    {
        *existing = entry;
        return;
    }
    config.servers.push(entry);
}

#[cfg(test)]
mod tests {
    use super::{upsert_server_config, ServerConfig, ServersConfig};

    fn server(name: &str, url: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            url: url.to_string(),
            username: "alice".to_string(),
            use_token_auth: true,
            auto_connect: false,
        }
    }

    #[test]
    fn test_defaults_applied_on_sparse_toml() {
        let config: ServersConfig = toml::from_str(
            r#"
            [[servers]]
            name = "Home"
            url = "https://music.example.com"
            username = "alice"
            "#,
        )
        .expect("sparse config should parse");
        assert_eq!(config.servers.len(), 1);
        assert!(config.servers[0].use_token_auth);
        assert!(!config.servers[0].auto_connect);
    }

    #[test]
    fn test_round_trip_preserves_entries() {
        let mut config = ServersConfig::default();
        upsert_server_config(&mut config, server("Home", "https://music.example.com/"));
        let text = toml::to_string(&config).expect("config should serialize");
        let restored: ServersConfig = toml::from_str(&text).expect("config should parse back");
        assert_eq!(restored, config);
        // trailing slash trimmed on the way in
        assert_eq!(restored.servers[0].url, "https://music.example.com");
    }

    #[test]
    fn test_upsert_replaces_by_name() {
        let mut config = ServersConfig::default();
        upsert_server_config(&mut config, server("Home", "https://old.example.com"));
        upsert_server_config(&mut config, server("Home", "https://new.example.com"));
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].url, "https://new.example.com");
    }
}
