use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::oauth2;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{
    ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod, read_application_secret,
};

const APP_NAME: &str = "gmex";
const TOKEN_KEY: &str = "gmail_token";

/// Read-only access is all the archive needs.
pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];

pub type GmailAuthenticator =
    oauth2::authenticator::Authenticator<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenData {
    tokens: Vec<TokenInfo>,
}

/// Token storage backed by the OS keyring.
pub struct RingStorage;

#[async_trait]
impl TokenStorage for RingStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> Result<()> {
        self.store(token)
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        self.load().ok().and_then(|data| data.tokens.into_iter().next())
    }
}

impl RingStorage {
    fn entry() -> Result<Entry> {
        Entry::new(APP_NAME, TOKEN_KEY).map_err(|e| anyhow::anyhow!("Keyring error: {}", e))
    }

    fn load(&self) -> Result<TokenData> {
        match Self::entry()?.get_password() {
            Ok(serialized) => {
                serde_json::from_str(&serialized).context("Failed to deserialize tokens")
            }
            Err(keyring::Error::NoEntry) => Ok(TokenData::default()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }

    pub fn store(&self, token: TokenInfo) -> Result<()> {
        let data = TokenData {
            tokens: vec![token],
        };
        let serialized = serde_json::to_string(&data).context("Failed to serialize tokens")?;
        Self::entry()?
            .set_password(&serialized)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))
    }

    /// Whether a token is stored, without printing it.
    pub fn status(&self) -> Result<bool> {
        Ok(!self.load()?.tokens.is_empty())
    }

    pub fn clear(&self) -> Result<()> {
        match Self::entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }

    /// Stores a token JSON document as produced by another OAuth client.
    pub fn import(&self, raw: &str) -> Result<()> {
        let token: TokenInfo = serde_json::from_str(raw.trim()).context("Invalid token JSON")?;
        self.store(token)
    }
}

pub struct Authenticator;

impl Authenticator {
    pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret> {
        let path = path.as_ref();
        read_application_secret(path)
            .await
            .with_context(|| format!("Failed to read application secret {}", path.display()))
    }

    pub async fn authenticate(secret: ApplicationSecret) -> Result<GmailAuthenticator> {
        let auth = InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
            .with_storage(Box::new(RingStorage))
            .build()
            .await
            .context("Failed to build authenticator")?;
        Ok(auth)
    }
}
