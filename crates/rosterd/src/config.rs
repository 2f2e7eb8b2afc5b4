use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use roster_core::{MatchPolicy, DEFAULT_TOLERANCE};

/// Daemon configuration, loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:8080).
    pub bind_addr: SocketAddr,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match (`ROSTER_TOLERANCE`).
    ///
    /// Embeddings are unit length, so this is a cosine floor of `1 - t²/2`:
    /// the default 0.6 is cosine 0.82. Loosen toward 1.0 (cosine 0.5) for
    /// poor lighting; values above 1.2 accept near-unrelated faces.
    pub tolerance: f32,
    pub match_policy: MatchPolicy,
    /// Upper bound on one image encode, queueing included.
    pub encode_timeout_secs: u64,
    /// Request body cap for uploads.
    pub max_upload_bytes: usize,
    /// Bearer token for management endpoints. `None` disables auth.
    pub api_token: Option<String>,
    /// Trusted kiosk deployment: `/mark-attendance` accepts unauthenticated captures.
    pub kiosk_mode: bool,
    /// Passphrase sealing stored embeddings at rest.
    pub embedding_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = roster_core::default_data_dir();
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            model_dir: roster_core::default_model_dir(),
            db_path: data_dir.join("roster.db"),
            tolerance: DEFAULT_TOLERANCE,
            match_policy: MatchPolicy::First,
            encode_timeout_secs: 10,
            max_upload_bytes: 10 * 1024 * 1024,
            api_token: None,
            kiosk_mode: false,
            embedding_key: None,
        }
    }
}

impl Config {
    /// Load configuration from `ROSTER_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("ROSTER_BIND", defaults.bind_addr),
            model_dir: std::env::var("ROSTER_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            db_path: std::env::var("ROSTER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            tolerance: env_parse("ROSTER_TOLERANCE", defaults.tolerance),
            match_policy: env_parse("ROSTER_MATCH_POLICY", defaults.match_policy),
            encode_timeout_secs: env_parse("ROSTER_ENCODE_TIMEOUT_SECS", defaults.encode_timeout_secs),
            max_upload_bytes: env_parse("ROSTER_MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            api_token: env_secret("ROSTER_API_TOKEN"),
            kiosk_mode: std::env::var("ROSTER_KIOSK_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.kiosk_mode),
            embedding_key: env_secret("ROSTER_EMBEDDING_KEY"),
        }
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs.max(1))
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("model_dir", &self.model_dir)
            .field("db_path", &self.db_path)
            .field("tolerance", &self.tolerance)
            .field("match_policy", &self.match_policy)
            .field("encode_timeout_secs", &self.encode_timeout_secs)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("kiosk_mode", &self.kiosk_mode)
            .field("embedding_key", &self.embedding_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_secret(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.tolerance, 0.6);
        assert_eq!(c.match_policy, MatchPolicy::First);
        assert!(!c.kiosk_mode);
        assert!(c.db_path.ends_with("roster/roster.db"));
        assert_eq!(c.encode_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("ROSTER_TEST_PARSE_F32", "not-a-number");
        assert_eq!(env_parse("ROSTER_TEST_PARSE_F32", 0.6f32), 0.6);
        std::env::set_var("ROSTER_TEST_PARSE_F32", " 0.45 ");
        assert_eq!(env_parse("ROSTER_TEST_PARSE_F32", 0.6f32), 0.45);
        std::env::remove_var("ROSTER_TEST_PARSE_F32");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let c = Config {
            api_token: Some("hunter2".into()),
            embedding_key: Some("sesame".into()),
            ..Config::default()
        };
        let rendered = format!("{c:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("sesame"));
    }
}
