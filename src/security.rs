//! Credential signing.
//!
//! Builds and digitally signs per-user credentials with the client's
//! private key: SHA-1 over the credential fields in declared order,
//! RSA PKCS#1 v1.5 over the digest.  The digest+sign primitive sits
//! behind [`CredentialSigner`] so everything above it is testable with
//! any backend; the RSA/SHA-1 implementation is the only one currently
//! shipped.  Signing is deterministic: the same tuple under the same
//! key yields byte-identical signatures.

use std::path::Path;

use log::debug;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::{PvfsError, PvfsResult};
use crate::types::{epoch_secs, Credential};

/// Default client private key location (`${sysconfdir}` install).
pub const DEFAULT_KEYFILE: &str = "/etc/pvfs2-clientkey.pem";

/// Default credential lifetime handed to the servers.
pub const DEFAULT_CREDENTIAL_TIMEOUT_SECS: i64 = 3600;

/// The digest+sign seam.
pub trait CredentialSigner: Send + Sync {
    /// Signature size in bytes, fixed by the key modulus.
    fn signature_size(&self) -> usize;
    /// Sign a message.  Failure at any step is `ESECURITY`.
    fn sign(&self, message: &[u8]) -> PvfsResult<Vec<u8>>;
}

/// SHA-1 + RSA PKCS#1 v1.5 signer over a loaded private key.
#[derive(Debug)]
pub struct RsaSha1Signer {
    key: SigningKey<Sha1>,
    size: usize,
}

impl RsaSha1Signer {
    pub fn new(key: RsaPrivateKey) -> RsaSha1Signer {
        let size = key.size();
        RsaSha1Signer {
            key: SigningKey::new(key),
            size,
        }
    }

    /// Load a PEM private key (PKCS#8, falling back to PKCS#1).
    ///
    /// Callers are expected to re-open the key file per signing pass or
    /// cache the signer at a higher layer; nothing is cached here.
    pub fn from_pem_file(path: &Path) -> PvfsResult<RsaSha1Signer> {
        if !path.exists() {
            return Err(PvfsError::ENOENT);
        }
        let key = RsaPrivateKey::read_pkcs8_pem_file(path)
            .or_else(|_| RsaPrivateKey::read_pkcs1_pem_file(path))
            .map_err(|e| {
                debug!("private key load failed: {}", e);
                PvfsError::ESECURITY
            })?;
        Ok(RsaSha1Signer::new(key))
    }
}

impl CredentialSigner for RsaSha1Signer {
    fn signature_size(&self) -> usize {
        self.size
    }

    fn sign(&self, message: &[u8]) -> PvfsResult<Vec<u8>> {
        let signature = self
            .key
            .try_sign(message)
            .map_err(|_| PvfsError::ESECURITY)?;
        Ok(signature.to_vec())
    }
}

/// The exact byte sequence fed to the digest: uid, group count, group
/// array, issuer bytes (no terminator), timeout.
fn signing_buffer(uid: u32, groups: &[u32], issuer: &str, timeout: i64) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(4 + 4 + groups.len() * 4 + issuer.len() + 8);
    buf.extend_from_slice(&uid.to_le_bytes());
    buf.extend_from_slice(&(groups.len() as u32).to_le_bytes());
    for gid in groups {
        buf.extend_from_slice(&gid.to_le_bytes());
    }
    buf.extend_from_slice(issuer.as_bytes());
    buf.extend_from_slice(&timeout.to_le_bytes());
    buf
}

/// Build and sign a credential.
pub fn sign_credential(
    signer: &dyn CredentialSigner,
    uid: u32,
    groups: &[u32],
    issuer: &str,
    timeout: i64,
) -> PvfsResult<Credential> {
    let message = signing_buffer(uid, groups, issuer, timeout);
    let signature = signer.sign(&message)?;
    Ok(Credential {
        userid: uid,
        groups: groups.to_vec(),
        issuer: issuer.to_owned(),
        timeout,
        signature,
        certificate: Vec::new(),
    })
}

/// Verify a credential's signature against the paired public key.
/// Used by tests and by anything that wants to sanity-check a
/// credential before presenting it.
pub fn verify_credential(key: &RsaPublicKey, credential: &Credential) -> bool {
    let message = signing_buffer(
        credential.userid,
        &credential.groups,
        &credential.issuer,
        credential.timeout,
    );
    let signature = match Signature::try_from(credential.signature.as_slice()) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    VerifyingKey::<Sha1>::new(key.clone())
        .verify(&message, &signature)
        .is_ok()
}

/// Builds the credential the dispatcher attaches to each operation,
/// signing when a key is available.  Without a key (security disabled
/// deployments) credentials go out unsigned and the servers decide.
pub struct CredentialFactory {
    signer: Option<Box<dyn CredentialSigner>>,
    issuer: String,
    timeout_secs: i64,
}

impl CredentialFactory {
    pub fn new(signer: Option<Box<dyn CredentialSigner>>, issuer: String) -> CredentialFactory {
        CredentialFactory {
            signer,
            issuer,
            timeout_secs: DEFAULT_CREDENTIAL_TIMEOUT_SECS,
        }
    }

    pub fn unsigned(issuer: String) -> CredentialFactory {
        CredentialFactory::new(None, issuer)
    }

    pub fn credential(&self, uid: u32, groups: &[u32]) -> PvfsResult<Credential> {
        let timeout = epoch_secs() + self.timeout_secs;
        match &self.signer {
            Some(signer) => sign_credential(signer.as_ref(), uid, groups, &self.issuer, timeout),
            None => Ok(Credential {
                userid: uid,
                groups: groups.to_vec(),
                issuer: self.issuer.clone(),
                timeout,
                signature: Vec::new(),
                certificate: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> RsaPrivateKey {
        // small key: these tests exercise the signing path, not RSA
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation")
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        let signer = RsaSha1Signer::new(key);
        let cred =
            sign_credential(&signer, 1001, &[100, 200], "alpha", 1_700_000_000).unwrap();
        assert_eq!(cred.signature.len(), signer.signature_size());
        assert!(verify_credential(&public, &cred));
    }

    #[test]
    fn tampering_fails_verification() {
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        let signer = RsaSha1Signer::new(key);
        let cred =
            sign_credential(&signer, 1001, &[100, 200], "alpha", 1_700_000_000).unwrap();

        let mut bad = cred.clone();
        bad.userid = 1002;
        assert!(!verify_credential(&public, &bad));

        let mut bad = cred.clone();
        bad.groups[0] ^= 1;
        assert!(!verify_credential(&public, &bad));

        let mut bad = cred.clone();
        bad.timeout += 1;
        assert!(!verify_credential(&public, &bad));

        let mut bad = cred;
        bad.signature[3] ^= 0x40;
        assert!(!verify_credential(&public, &bad));
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = RsaSha1Signer::new(test_key());
        let a = sign_credential(&signer, 1001, &[100, 200], "alpha", 1_700_000_000).unwrap();
        let b = sign_credential(&signer, 1001, &[100, 200], "alpha", 1_700_000_000).unwrap();
        assert_eq!(a.signature, b.signature);
    }

    #[test]
    fn field_order_matters() {
        // swapping uid bytes into the group bank must change the message
        assert_ne!(
            signing_buffer(1, &[2], "x", 3),
            signing_buffer(2, &[1], "x", 3)
        );
    }

    #[test]
    fn missing_keyfile_is_enoent() {
        let err =
            RsaSha1Signer::from_pem_file(Path::new("/nonexistent/clientkey.pem")).unwrap_err();
        assert_eq!(err, PvfsError::ENOENT);
    }

    #[test]
    fn pem_file_round_trip() {
        use rsa::pkcs8::EncodePrivateKey;
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clientkey.pem");
        key.write_pkcs8_pem_file(&path, rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let signer = RsaSha1Signer::from_pem_file(&path).unwrap();
        let cred = sign_credential(&signer, 7, &[8], "issuer", 99).unwrap();
        assert!(verify_credential(&public, &cred));
    }

    #[test]
    fn unsigned_factory_builds_bare_credentials() {
        let factory = CredentialFactory::unsigned("client-host".into());
        let cred = factory.credential(1000, &[1000, 4]).unwrap();
        assert!(cred.signature.is_empty());
        assert_eq!(cred.issuer, "client-host");
        assert!(cred.timeout > epoch_secs());
    }
}
