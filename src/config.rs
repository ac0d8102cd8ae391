use tracing::{info, warn};

const ENV_FILE_PROD: &str = ".env.production";
const ENV_FILE_DEV: &str = ".env.development";

// ---------------------------------------------------------------------------
// Server configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// `APP_ENV=production` selects `.env.production`, anything else selects
/// `.env.development`. The file is loaded best-effort; a missing file is
/// logged and tolerated so the process can run from plain environment
/// variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP listener to.
    pub http_address: String,

    /// Directory of the built web UI, served with SPA index fallback.
    pub static_dir: String,

    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Load the `.env` file selected by `APP_ENV`. Best-effort: a missing file
/// is tolerated so the process can run from plain environment variables.
/// Idempotent; already-set variables are never overridden.
pub fn load_env() {
    let env_file = if std::env::var("APP_ENV").as_deref() == Ok("production") {
        ENV_FILE_PROD
    } else {
        ENV_FILE_DEV
    };
    match dotenvy::from_filename(env_file) {
        Ok(_) => info!("Loaded environment from `{env_file}`"),
        Err(e) => warn!("Could not load `{env_file}`: {e}"),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        load_env();

        let config = Config {
            http_address: env_or("HTTP_ADDRESS", "localhost:8080"),
            static_dir: env_or("ROOMCAST_STATIC_DIR", "./web/build"),
            log_level: env_or("ROOMCAST_LOG_LEVEL", "info"),
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── Roomcast Configuration ────");
        info!("  http_address : {}", self.http_address);
        info!("  static_dir   : {}", self.static_dir);
        info!("  log_level    : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default() {
        std::env::remove_var("ROOMCAST_TEST_UNSET");
        assert_eq!(env_or("ROOMCAST_TEST_UNSET", "fallback"), "fallback");
    }

    #[test]
    fn env_or_reads_variable() {
        std::env::set_var("ROOMCAST_TEST_SET", "value");
        assert_eq!(env_or("ROOMCAST_TEST_SET", "fallback"), "value");
        std::env::remove_var("ROOMCAST_TEST_SET");
    }
}
