//! Persistent node identity.
//!
//! A node's identity is a single secret key stored as hex text at an
//! operator-chosen path. The key is generated on first start and reused on
//! every later start, so the derived [`NodeId`] is stable across restarts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use iroh::{EndpointId, SecretKey};
use rand::RngCore;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::id::NodeId;

/// Secret key plus the node id derived from its public half.
#[derive(Clone)]
pub struct NodeIdentity {
    secret_key: SecretKey,
    node_id: NodeId,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl NodeIdentity {
    /// Load the identity stored at `path`, generating and persisting a new
    /// one if the file does not exist.
    ///
    /// A leading `~` is expanded to the home directory and missing parent
    /// directories are created. New key files are written owner-only.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_path(path.as_ref());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| Error::IdentityIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let secret_key = match fs::read_to_string(&path) {
            Ok(text) => {
                let key = decode_key(&path, &text)?;
                debug!(path = %path.display(), "loaded identity key");
                key
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = generate_key();
                persist_key(&path, &key)?;
                info!(path = %path.display(), "generated new identity key");
                key
            }
            Err(source) => return Err(Error::IdentityIo { path, source }),
        };

        Ok(Self::from_secret_key(secret_key))
    }

    /// Generate an identity that is never written to disk.
    pub fn generate() -> Self {
        Self::from_secret_key(generate_key())
    }

    /// Wrap an existing secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let node_id = NodeId::from(secret_key.public());
        Self {
            secret_key,
            node_id,
        }
    }

    /// The node id derived from the public key.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The transport-level peer id.
    pub fn endpoint_id(&self) -> EndpointId {
        self.secret_key.public()
    }

    /// The secret key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

fn generate_key() -> SecretKey {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    SecretKey::from_bytes(&bytes)
}

fn decode_key(path: &Path, text: &str) -> Result<SecretKey> {
    let malformed = |reason: String| Error::Identity {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = hex::decode(text.trim()).map_err(|e| malformed(format!("not hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| malformed(format!("expected 32 bytes, found {}", b.len())))?;
    Ok(SecretKey::from_bytes(&bytes))
}

fn persist_key(path: &Path, key: &SecretKey) -> Result<()> {
    let io_err = |source| Error::IdentityIo {
        path: path.to_path_buf(),
        source,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_err)?;
    writeln!(file, "{}", hex::encode(key.to_bytes())).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

/// Expand a leading `~` to the current user's home directory.
fn expand_path(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_same_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.key");

        let first = NodeIdentity::load(&path).unwrap();
        assert!(path.exists());
        let second = NodeIdentity::load(&path).unwrap();

        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.secret_key().to_bytes(), second.secret_key().to_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        NodeIdentity::load(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "definitely not a key").unwrap();

        let err = NodeIdentity::load(&path).unwrap_err();
        assert!(matches!(err, Error::Identity { .. }));
    }

    #[test]
    fn short_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "abcd").unwrap();

        let err = NodeIdentity::load(&path).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_path(Path::new("~/.kvm/identity.key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".kvm/identity.key"));
        }
        assert_eq!(
            expand_path(Path::new("/etc/kvm.key")),
            PathBuf::from("/etc/kvm.key")
        );
    }

    #[test]
    fn distinct_generated_identities() {
        assert_ne!(
            NodeIdentity::generate().node_id(),
            NodeIdentity::generate().node_id()
        );
    }
}
