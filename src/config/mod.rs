// Config loader and validator.
//
// Loads relay.yaml, applies defaults, resolves ${VAR} interpolation for
// secret values, and validates the endpoint and inference parameters.

use axum::http::Uri;
use serde::Deserialize;

use crate::backend::bedrock::{infer_region, InferenceDefaults};
use crate::relay::StreamingMode;

/// Region assumed when none is configured and none can be inferred from the
/// endpoint authority.
pub const FALLBACK_REGION: &str = "us-east-1";

const DEFAULT_ENDPOINT: &str = "https://bedrock-runtime.us-east-1.amazonaws.com";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All errors that can occur during config loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config source: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("undefined variable ${{{name}}} in config (not set in environment)")]
    UndefinedVariable { name: String },
}

// ---------------------------------------------------------------------------
// ConfigSource trait (interface-first, dependency injection)
// ---------------------------------------------------------------------------

/// Abstraction over where config YAML comes from.
///
/// `FileSource` reads from disk; `StringSource` provides content directly
/// (used in tests to avoid file I/O).
pub trait ConfigSource {
    fn load(&self) -> Result<String, ConfigError>;
}

/// Loads config from a file on disk.
pub struct FileSource {
    pub path: std::path::PathBuf,
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<String, ConfigError> {
        Ok(std::fs::read_to_string(&self.path)?)
    }
}

/// Provides config content directly as a string. Used for testing.
pub struct StringSource {
    pub content: String,
}

impl ConfigSource for StringSource {
    fn load(&self) -> Result<String, ConfigError> {
        Ok(self.content.clone())
    }
}

// ---------------------------------------------------------------------------
// Typed config
// ---------------------------------------------------------------------------

/// How callers are authenticated. The two mechanisms correspond to
/// different deployments and are never combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// An IAM-verifying front door (signed calls) authenticates callers
    /// before they reach the relay; the relay itself enforces nothing.
    Signed,
    /// A trusted front door injects a shared secret header; the relay
    /// rejects requests that do not carry it.
    FrontDoorSecret { secret: String },
}

/// Top-level parsed and validated relay config.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Model backend endpoint URL.
    pub endpoint: String,
    /// Signing region. When absent it is inferred from the endpoint
    /// authority, falling back to [`FALLBACK_REGION`].
    pub region: Option<String>,
    pub auth: AuthMode,
    pub streaming: StreamingMode,
    pub inference: InferenceDefaults,
    /// Outbound call deadline. The surrounding platform enforces the
    /// overall request deadline; this only bounds the backend call.
    pub timeout_ms: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            region: None,
            auth: AuthMode::Signed,
            streaming: StreamingMode::Incremental,
            inference: InferenceDefaults::default(),
            timeout_ms: None,
        }
    }
}

impl RelayConfig {
    /// The signing region: explicit config wins, then endpoint inference,
    /// then the fixed fallback.
    pub fn resolved_region(&self) -> String {
        if let Some(region) = &self.region {
            return region.clone();
        }
        self.endpoint
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.authority().and_then(|a| infer_region(a.as_str())))
            .unwrap_or_else(|| FALLBACK_REGION.to_string())
    }
}

// ---------------------------------------------------------------------------
// Raw YAML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    endpoint: Option<String>,
    region: Option<String>,
    auth: Option<RawAuth>,
    streaming: Option<String>,
    inference: Option<RawInference>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAuth {
    mode: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInference {
    max_tokens: Option<u32>,
    temperature: Option<f64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load, interpolate, and validate config from a source.
pub fn load_config(source: &dyn ConfigSource) -> Result<RelayConfig, ConfigError> {
    let text = source.load()?;
    let raw: RawConfig = serde_yaml::from_str(&text)?;
    let defaults = RelayConfig::default();

    let endpoint = raw.endpoint.unwrap_or(defaults.endpoint);
    let parsed: Uri = endpoint
        .parse()
        .map_err(|_| ConfigError::Validation(format!("endpoint is not a valid URL: {endpoint}")))?;
    if parsed.authority().is_none() || parsed.scheme().is_none() {
        return Err(ConfigError::Validation(format!(
            "endpoint must be an absolute http(s) URL: {endpoint}"
        )));
    }

    let auth = match raw.auth {
        None => AuthMode::Signed,
        Some(raw_auth) => match raw_auth.mode.as_str() {
            "signed" => AuthMode::Signed,
            "front-door-secret" => {
                let secret = raw_auth.secret.ok_or_else(|| {
                    ConfigError::Validation(
                        "auth.secret is required when auth.mode is front-door-secret".to_string(),
                    )
                })?;
                let secret = resolve_variables(&secret)?;
                if secret.is_empty() {
                    return Err(ConfigError::Validation(
                        "auth.secret must not be empty".to_string(),
                    ));
                }
                AuthMode::FrontDoorSecret { secret }
            }
            other => {
                return Err(ConfigError::Validation(format!(
                    "auth.mode must be \"signed\" or \"front-door-secret\", got \"{other}\""
                )))
            }
        },
    };

    let streaming = match raw.streaming.as_deref() {
        None | Some("incremental") => StreamingMode::Incremental,
        Some("buffered") => StreamingMode::Buffered,
        Some(other) => {
            return Err(ConfigError::Validation(format!(
                "streaming must be \"incremental\" or \"buffered\", got \"{other}\""
            )))
        }
    };

    let mut inference = InferenceDefaults::default();
    if let Some(raw_inference) = raw.inference {
        if let Some(max_tokens) = raw_inference.max_tokens {
            if max_tokens == 0 {
                return Err(ConfigError::Validation(
                    "inference.max_tokens must be greater than zero".to_string(),
                ));
            }
            inference.max_tokens = max_tokens;
        }
        if let Some(temperature) = raw_inference.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err(ConfigError::Validation(format!(
                    "inference.temperature must be within [0.0, 1.0], got {temperature}"
                )));
            }
            inference.temperature = temperature;
        }
    }

    Ok(RelayConfig {
        endpoint,
        region: raw.region,
        auth,
        streaming,
        inference,
        timeout_ms: raw.timeout_ms,
    })
}

// ---------------------------------------------------------------------------
// Variable interpolation
// ---------------------------------------------------------------------------

/// Resolves `${VAR_NAME}` references in a string from environment variables.
/// Returns `ConfigError::UndefinedVariable` if a referenced variable is not
/// set; malformed references are kept literally.
fn resolve_variables(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            let mut found_close = false;
            for c in chars.by_ref() {
                if c == '}' {
                    found_close = true;
                    break;
                }
                var_name.push(c);
            }
            if !found_close || var_name.is_empty() {
                result.push('$');
                result.push('{');
                result.push_str(&var_name);
                continue;
            }
            let value = std::env::var(&var_name).map_err(|_| ConfigError::UndefinedVariable {
                name: var_name.clone(),
            })?;
            result.push_str(&value);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
