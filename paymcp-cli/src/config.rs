//! Client configuration.
//!
//! Loaded from a TOML file. String values may reference the environment with
//! `$VAR` or `${VAR}`; references that do not resolve are kept verbatim.
//!
//! # Example Configuration
//!
//! ```toml
//! probe_timeout_secs = 5
//!
//! [wallet]
//! private_key = "$PAYMCP_PRIVATE_KEY"
//!
//! [payment]
//! network = "base-sepolia"
//! max_amount = "100000"
//!
//! [oauth]
//! redirect_url = "http://localhost:5173/oauth/callback"
//! token_file = ".paymcp/tokens.json"
//!
//! [servers.search]
//! url = "https://search.example.com/mcp"
//! transport = "httpStream"
//! ```
//!
//! # Environment Variables
//!
//! - `PAYMCP_CONFIG` - Path to the configuration file (default: `paymcp.toml`)
//! - Keys referenced by `$VAR` in the file

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use paymcp::amount::TokenAmount;
use paymcp_evm::{BASE_MAINNET, chain_id_for};
use paymcp_mcp::ServerEndpoint;
use paymcp_mcp::auth::DEFAULT_REDIRECT_URL;
use serde::{Deserialize, Serialize};

/// Errors raised while loading or querying the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid configuration TOML.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A server argument is neither a configured name nor an HTTP(S) URL.
    #[error("unknown server {0:?}: not configured and not an http(s) URL")]
    UnknownServer(String),
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Named MCP servers.
    #[serde(default)]
    pub servers: HashMap<String, ServerEndpoint>,

    /// Key used for DID request signing and payments.
    #[serde(default)]
    pub wallet: Option<WalletConfig>,

    /// Payment policy. Tool calls are never paid for without it.
    #[serde(default)]
    pub payment: Option<PaymentConfig>,

    /// OAuth settings.
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Transport probe timeout in seconds (default: `5`).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Operation tag placed in signed DID headers (default: `mcp`).
    #[serde(default)]
    pub signing_operation: Option<String>,
}

/// Wallet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Hex private key, with or without `0x`.
    pub private_key: String,

    /// Chain id embedded in the DID. Defaults to the payment network's chain,
    /// then Base mainnet.
    #[serde(default)]
    pub chain_id: Option<u64>,
}

/// Payment policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// The only network payments are made on (e.g. `base-sepolia`).
    pub network: String,

    /// Largest amount paid per call, in base units.
    pub max_amount: TokenAmount,
}

/// OAuth configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Redirect URL registered with authorization servers.
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,

    /// File the tokens are persisted in.
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,

    /// How long to wait for the browser round trip, in seconds.
    #[serde(default = "default_popup_timeout_secs")]
    pub popup_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_url: default_redirect_url(),
            token_file: default_token_file(),
            popup_timeout_secs: default_popup_timeout_secs(),
        }
    }
}

const fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_redirect_url() -> String {
    DEFAULT_REDIRECT_URL.to_owned()
}

fn default_token_file() -> PathBuf {
    PathBuf::from(".paymcp/tokens.json")
}

const fn default_popup_timeout_secs() -> u64 {
    300
}

impl ClientConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields the defaults. Environment references are
    /// expanded before parsing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file exists but cannot be read and
    /// [`ConfigError::Parse`] if it is not valid.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?
        } else {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            String::new()
        };
        Self::parse(&content)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not valid.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&expand_env_vars(content))?)
    }

    /// Resolves a command-line server argument.
    ///
    /// Configured names win; anything else must be an HTTP(S) URL, whose
    /// transport is then probed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownServer`] for anything else.
    pub fn endpoint(&self, server: &str) -> Result<ServerEndpoint, ConfigError> {
        if let Some(endpoint) = self.servers.get(server) {
            return Ok(endpoint.clone());
        }
        match url::Url::parse(server) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(ServerEndpoint::new(server)),
            _ => Err(ConfigError::UnknownServer(server.to_owned())),
        }
    }

    /// Chain id embedded in the DID.
    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.wallet
            .as_ref()
            .and_then(|wallet| wallet.chain_id)
            .or_else(|| {
                self.payment
                    .as_ref()
                    .and_then(|payment| chain_id_for(&payment.network))
            })
            .unwrap_or(BASE_MAINNET)
    }
}

/// Replaces `$VAR` and `${VAR}` with values from the environment.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            braced.find('}').map_or(("", 0), |end| (&braced[..end], end + 2))
        } else {
            let end = after
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        match (!name.is_empty()).then(|| std::env::var(name).ok()).flatten() {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[pos..=pos + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use paymcp_mcp::TransportKind;

    #[test]
    fn test_expand_env_vars() {
        let path = std::env::var("PATH").unwrap();
        assert_eq!(expand_env_vars("a=$PATH;"), format!("a={path};"));
        assert_eq!(expand_env_vars("${PATH}x"), format!("{path}x"));
        assert_eq!(
            expand_env_vars("$PAYMCP_SURELY_UNSET ${PAYMCP_SURELY_UNSET}"),
            "$PAYMCP_SURELY_UNSET ${PAYMCP_SURELY_UNSET}"
        );
        assert_eq!(expand_env_vars("cost: 5$ and ${open"), "cost: 5$ and ${open");
    }

    #[test]
    fn test_parse_full_config() {
        let config = ClientConfig::parse(
            r#"
            signing_operation = "agent"

            [wallet]
            private_key = "0x01"

            [payment]
            network = "base-sepolia"
            max_amount = "100000"

            [servers.search]
            url = "https://search.example.com/mcp"
            transport = "sse"
            "#,
        )
        .unwrap();

        assert_eq!(config.probe_timeout_secs, 5);
        assert_eq!(config.oauth.redirect_url, DEFAULT_REDIRECT_URL);
        assert_eq!(config.oauth.popup_timeout_secs, 300);
        let payment = config.payment.as_ref().unwrap();
        assert_eq!(payment.max_amount, TokenAmount::from(100_000));
        assert_eq!(config.chain_id(), 84532);

        let search = config.endpoint("search").unwrap();
        assert_eq!(search.url, "https://search.example.com/mcp");
        assert_eq!(search.transport, Some(TransportKind::Sse));
    }

    #[test]
    fn test_endpoint_accepts_urls_only() {
        let config = ClientConfig::parse("").unwrap();
        let adhoc = config.endpoint("http://localhost:3000/mcp").unwrap();
        assert_eq!(adhoc.transport, None);
        assert!(matches!(
            config.endpoint("search"),
            Err(ConfigError::UnknownServer(_))
        ));
        assert!(config.endpoint("file:///tmp/x").is_err());
        assert_eq!(config.chain_id(), BASE_MAINNET);
    }

    #[test]
    fn test_invalid_amount_is_a_parse_error() {
        let err = ClientConfig::parse("[payment]\nnetwork = \"base\"\nmax_amount = \"1.5\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ClientConfig::load_from(Path::new("/nonexistent/paymcp.toml")).unwrap();
        assert!(config.servers.is_empty());
        assert!(config.wallet.is_none());
    }
}
