//! Per-request Ceph credentials.
//!
//! Secrets arrive with each gRPC request and never touch the cluster map
//! file. The key is written to an owner-only temp keyring so the Ceph CLIs
//! can consume it; the file lives exactly as long as the `Credentials`
//! value. Dropping destroys: the keyring is unlinked and the in-memory key
//! overwritten.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{EngineError, Result};

const SECRET_USER_ID: &str = "userID";
const SECRET_USER_KEY: &str = "userKey";
const SECRET_ADMIN_ID: &str = "adminID";
const SECRET_ADMIN_KEY: &str = "adminKey";

/// Scoped holder of a Ceph user id and its keyring file.
///
/// Owned exclusively by the request that created it; not `Clone` on
/// purpose.
#[derive(Debug)]
pub struct Credentials {
    id: String,
    key: String,
    keyfile: Option<NamedTempFile>,
}

impl Credentials {
    /// Build credentials from a request secret map.
    ///
    /// Accepts either the user pair (`userID`/`userKey`) or the admin pair
    /// (`adminID`/`adminKey`), preferring the user pair.
    pub fn from_secrets(secrets: &std::collections::HashMap<String, String>) -> Result<Self> {
        let (id, key) = if let (Some(id), Some(key)) =
            (secrets.get(SECRET_USER_ID), secrets.get(SECRET_USER_KEY))
        {
            (id, key)
        } else if let (Some(id), Some(key)) =
            (secrets.get(SECRET_ADMIN_ID), secrets.get(SECRET_ADMIN_KEY))
        {
            (id, key)
        } else {
            return Err(EngineError::CredentialInvalid(
                "secrets must carry userID/userKey or adminID/adminKey".to_string(),
            ));
        };

        if id.is_empty() || key.is_empty() {
            return Err(EngineError::CredentialInvalid(
                "empty user id or key in secrets".to_string(),
            ));
        }

        let keyfile = Self::write_keyfile(id, key)?;

        Ok(Self {
            id: id.clone(),
            key: key.clone(),
            keyfile: Some(keyfile),
        })
    }

    fn write_keyfile(id: &str, key: &str) -> Result<NamedTempFile> {
        use std::io::Write;

        let mut file = NamedTempFile::new().map_err(|e| {
            EngineError::Internal(format!("failed to create keyring file: {e}"))
        })?;

        // Keyring format understood by every Ceph CLI.
        write!(file, "[client.{id}]\n\tkey = {key}\n").map_err(|e| {
            EngineError::Internal(format!("failed to write keyring file: {e}"))
        })?;
        file.flush()
            .map_err(|e| EngineError::Internal(format!("failed to flush keyring file: {e}")))?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), Permissions::from_mode(0o600)).map_err(
                |e| EngineError::Internal(format!("failed to chmod keyring file: {e}")),
            )?;
        }

        Ok(file)
    }

    /// The Ceph user id (without the `client.` prefix).
    pub fn user(&self) -> &str {
        &self.id
    }

    /// Path of the keyring file, valid until destroy.
    pub fn keyfile_path(&self) -> Result<&Path> {
        self.keyfile
            .as_ref()
            .map(|f| f.path())
            .ok_or_else(|| {
                EngineError::CredentialInvalid("credentials already destroyed".to_string())
            })
    }

    /// Stable fingerprint of the key, safe to use as a cache key without
    /// exposing the key itself.
    pub fn key_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Unlink the keyring file and overwrite the in-memory key. Runs on
    /// drop too; calling it explicitly surfaces unlink failures.
    pub fn destroy(&mut self) -> Result<()> {
        // Overwrite before freeing so the key does not linger on the heap.
        let mut bytes = std::mem::take(&mut self.key).into_bytes();
        for b in bytes.iter_mut() {
            *b = 0;
        }

        if let Some(file) = self.keyfile.take() {
            let path: PathBuf = file.path().to_path_buf();
            file.close().map_err(|e| {
                EngineError::Internal(format!(
                    "failed to remove keyring file {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn secrets(id_key: &str, key_key: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(id_key.to_string(), "csi-user".to_string());
        map.insert(key_key.to_string(), "AQBuzODkExampleKey==".to_string());
        map
    }

    #[test]
    fn test_from_user_secrets() {
        let mut creds = Credentials::from_secrets(&secrets("userID", "userKey")).unwrap();
        assert_eq!(creds.user(), "csi-user");

        let path = creds.keyfile_path().unwrap().to_path_buf();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[client.csi-user]"));
        assert!(content.contains("key = AQBuzODkExampleKey=="));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        creds.destroy().unwrap();
        assert!(!path.exists());
        assert!(creds.keyfile_path().is_err());
    }

    #[test]
    fn test_admin_pair_accepted() {
        let creds = Credentials::from_secrets(&secrets("adminID", "adminKey")).unwrap();
        assert_eq!(creds.user(), "csi-user");
    }

    #[test]
    fn test_missing_secrets_rejected() {
        let result = Credentials::from_secrets(&HashMap::new());
        assert!(matches!(result, Err(EngineError::CredentialInvalid(_))));
    }

    #[test]
    fn test_keyfile_removed_on_drop() {
        let path = {
            let creds = Credentials::from_secrets(&secrets("userID", "userKey")).unwrap();
            creds.keyfile_path().unwrap().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_fingerprint_is_stable_and_opaque() {
        let a = Credentials::from_secrets(&secrets("userID", "userKey")).unwrap();
        let b = Credentials::from_secrets(&secrets("userID", "userKey")).unwrap();
        assert_eq!(a.key_fingerprint(), b.key_fingerprint());
        assert!(!a.key_fingerprint().contains("AQBuzODk"));
    }
}
