use async_trait::async_trait;
use jsonwebtoken::Algorithm;
use std::path::PathBuf;

use super::error::KeyError;

/// Supported token signing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    RS256,
    ES256,
}

impl SigningAlgorithm {
    pub fn parse(value: &str) -> Result<Self, KeyError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RS256" => Ok(SigningAlgorithm::RS256),
            "ES256" => Ok(SigningAlgorithm::ES256),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::RS256 => "RS256",
            SigningAlgorithm::ES256 => "ES256",
        }
    }

    pub fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::RS256 => Algorithm::RS256,
            SigningAlgorithm::ES256 => Algorithm::ES256,
        }
    }
}

/// PEM-encoded key pair.
#[derive(Clone)]
pub struct KeyPair {
    pub algorithm: SigningAlgorithm,
    pub private_pem: String,
    pub public_pem: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("private_pem", &"[REDACTED]")
            .finish()
    }
}

/// Source of the token signing keys.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    async fn load_private_key(&self) -> Result<String, KeyError>;
    async fn load_keys(&self, algorithm: SigningAlgorithm) -> Result<KeyPair, KeyError>;
}

/// Keys stored as PEM files on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileKeyStorage {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
}

impl FileKeyStorage {
    pub fn new(private_key_path: impl Into<PathBuf>, public_key_path: impl Into<PathBuf>) -> Self {
        Self {
            private_key_path: private_key_path.into(),
            public_key_path: public_key_path.into(),
        }
    }

    async fn read(path: &PathBuf) -> Result<String, KeyError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| KeyError::Read {
                path: path.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl KeyStorage for FileKeyStorage {
    async fn load_private_key(&self) -> Result<String, KeyError> {
        Self::read(&self.private_key_path).await
    }

    async fn load_keys(&self, algorithm: SigningAlgorithm) -> Result<KeyPair, KeyError> {
        let private_pem = self.load_private_key().await?;
        let public_pem = Self::read(&self.public_key_path).await?;
        tracing::info!(
            algorithm = algorithm.as_str(),
            path = %self.private_key_path.display(),
            "Loaded signing keys from file"
        );
        Ok(KeyPair {
            algorithm,
            private_pem,
            public_pem,
        })
    }
}

/// Keys already held in memory.
#[derive(Clone)]
pub struct StaticKeyStorage {
    private_pem: String,
    public_pem: String,
}

impl StaticKeyStorage {
    pub fn new(private_pem: impl Into<String>, public_pem: impl Into<String>) -> Self {
        Self {
            private_pem: private_pem.into(),
            public_pem: public_pem.into(),
        }
    }
}

#[async_trait]
impl KeyStorage for StaticKeyStorage {
    async fn load_private_key(&self) -> Result<String, KeyError> {
        Ok(self.private_pem.clone())
    }

    async fn load_keys(&self, algorithm: SigningAlgorithm) -> Result<KeyPair, KeyError> {
        Ok(KeyPair {
            algorithm,
            private_pem: self.private_pem.clone(),
            public_pem: self.public_pem.clone(),
        })
    }
}
