use std::collections::HashMap;

/// Full application configuration loaded from environment / `.env` file.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub artifact_root: String,
    pub bind_addr: String,

    /// Mount point of the project workspace inside a build container.
    pub container_workspace: String,
    pub default_container_image: String,
    pub default_timeout_minutes: i64,

    pub max_concurrent_builds: u32,
    pub orchestrator_tick_s: u64,
    pub default_step_timeout_s: u64,

    /// Per-installation fallback webhook secret when a project has none set.
    pub webhook_secret: String,
    /// 32-byte key, base64-encoded, for the secret vault (AES-256-GCM).
    pub vault_key_b64: String,
    /// Process secret used to HMAC API tokens at verification time.
    pub api_token_secret: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let dotenv = parse_dotenv();
        Ok(Self {
            data_dir: get_str("ANDO_DATA_DIR", &dotenv, "./data"),
            artifact_root: get_str("ANDO_ARTIFACT_ROOT", &dotenv, "./data/artifacts"),
            bind_addr: get_str("ANDO_BIND_ADDR", &dotenv, "0.0.0.0:8080"),
            container_workspace: get_str("ANDO_CONTAINER_WORKSPACE", &dotenv, "/workspace"),
            default_container_image: get_str(
                "ANDO_DEFAULT_IMAGE",
                &dotenv,
                "ando/build-runner:latest",
            ),
            default_timeout_minutes: get_i64("ANDO_DEFAULT_TIMEOUT_MINUTES", &dotenv, 15),
            max_concurrent_builds: get_u32("ANDO_MAX_CONCURRENT_BUILDS", &dotenv, 4),
            orchestrator_tick_s: get_u64("ANDO_TICK_S", &dotenv, 2),
            default_step_timeout_s: get_u64("ANDO_STEP_TIMEOUT_S", &dotenv, 300),
            webhook_secret: get_str("ANDO_WEBHOOK_SECRET", &dotenv, ""),
            vault_key_b64: get_str("ANDO_VAULT_KEY", &dotenv, ""),
            api_token_secret: get_str("ANDO_API_TOKEN_SECRET", &dotenv, ""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_when_env_unset() {
        // parse_dotenv reads from CWD's .env, which may or may not exist in
        // the test sandbox; get_str/get_u32 fall back to defaults regardless.
        let empty = HashMap::new();
        assert_eq!(get_str("ANDO_DOES_NOT_EXIST", &empty, "fallback"), "fallback");
        assert_eq!(get_u32("ANDO_DOES_NOT_EXIST", &empty, 4), 4);
        assert_eq!(get_i64("ANDO_DOES_NOT_EXIST", &empty, 15), 15);
    }
}
