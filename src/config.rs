use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `"development"` disables the forced HTTPS upgrade.
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
    pub max_age_secs: u64,
    pub exempt_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Brotli is only applied above this many body bytes. Gzip has no gate.
    pub min_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub internal_asset_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

fn default_environment() -> String {
    "production".to_string()
}

// Mirror defaults from config/default.toml
impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8080, environment: default_environment() }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { request_timeout_secs: 30 }
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: "csrf_token".to_string(),
            header_name: "x-csrf-token".to_string(),
            max_age_secs: 3600,
            exempt_prefix: "/api/".to_string(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { min_size: 1024 }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost".to_string(),
                "http://localhost:8000".to_string(),
                "http://127.0.0.1".to_string(),
                "http://127.0.0.1:8000".to_string(),
            ],
            internal_asset_prefix: "/_internal/".to_string(),
        }
    }
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.server.environment.eq_ignore_ascii_case("development")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.request_timeout_secs)
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let defaults: &str = include_str!("../config/default.toml");
    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(defaults, ::config::FileFormat::Toml))
        // Optional local file: edgeguard.toml (in CWD)
        .add_source(::config::File::with_name("edgeguard").required(false));

    if let Ok(custom_path) = std::env::var("EDGEGUARD_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(
        ::config::Environment::with_prefix("EDGEGUARD")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("security.allowed_origins")
            .try_parsing(true),
    );

    let cfg = builder.build()?;
    let app_cfg: AppConfig = cfg.try_deserialize()?;
    validate(&app_cfg)?;
    Ok(app_cfg)
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    // Server
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }
    #[cfg(unix)]
    if cfg.server.port < 1024 {
        tracing::warn!("Using privileged port {} - may require elevated permissions", cfg.server.port);
    }

    if cfg.pipeline.request_timeout_secs == 0 {
        return Err(anyhow::anyhow!("pipeline.request_timeout_secs must be > 0"));
    }

    // CSRF
    if cfg.csrf.max_age_secs == 0 {
        return Err(anyhow::anyhow!("csrf.max_age_secs must be > 0"));
    }
    if cfg.csrf.cookie_name.trim().is_empty() {
        return Err(anyhow::anyhow!("csrf.cookie_name must not be empty"));
    }
    if cfg.csrf.header_name.trim().is_empty() {
        return Err(anyhow::anyhow!("csrf.header_name must not be empty"));
    }
    if axum::http::HeaderName::from_bytes(cfg.csrf.header_name.as_bytes()).is_err() {
        return Err(anyhow::anyhow!("csrf.header_name is not a valid header name: {}", cfg.csrf.header_name));
    }

    // A prefix of "" or "/" matches every path.
    if !cfg.csrf.exempt_prefix.starts_with('/') || cfg.csrf.exempt_prefix == "/" {
        return Err(anyhow::anyhow!(
            "csrf.exempt_prefix must start with '/' and name a subtree, got {:?}",
            cfg.csrf.exempt_prefix
        ));
    }

    // Security
    if !cfg.security.internal_asset_prefix.starts_with('/') || cfg.security.internal_asset_prefix == "/" {
        return Err(anyhow::anyhow!(
            "security.internal_asset_prefix must start with '/' and name a subtree, got {:?}",
            cfg.security.internal_asset_prefix
        ));
    }
    if !cfg.is_development() && !cfg.server.environment.eq_ignore_ascii_case("production") {
        tracing::warn!(
            "Unknown server.environment '{}' - treating as production",
            cfg.server.environment
        );
    }

    Ok(())
}
