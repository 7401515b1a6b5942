use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("missing token")]
    MissingToken,
}

/// Identity attached to an authenticated connection.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
}

/// Pluggable credential check for the handshake. The bundled implementation
/// compares against a shared secret; deployments fronted by an identity
/// provider supply their own.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Verifies tokens against a single deployment-wide secret. Comparison goes
/// through a sha256 digest so the secret itself never sits next to attacker
/// input in a timing-sensitive compare.
pub struct SharedSecretVerifier {
    secret_digest: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret_digest: digest(secret),
        }
    }
}

impl TokenVerifier for SharedSecretVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if digest(token) == self.secret_digest {
            Ok(Principal {
                subject: "shared-secret".to_string(),
            })
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_secret() {
        let verifier = SharedSecretVerifier::new("hunter2");
        assert!(verifier.verify("hunter2").is_ok());
    }

    #[test]
    fn rejects_wrong_or_empty_token() {
        let verifier = SharedSecretVerifier::new("hunter2");
        assert!(matches!(
            verifier.verify("hunter3"),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(verifier.verify(""), Err(AuthError::MissingToken)));
    }
}
