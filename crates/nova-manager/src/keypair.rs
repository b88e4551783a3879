use std::path::{Path, PathBuf};

use ssh_key::{HashAlg, PublicKey};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{Result, VmError};
use crate::traits::ComputeApi;
use crate::types::Keypair;

const PRIVATE_KEY_MODE: u32 = 0o600;
const PUBLIC_KEY_MODE: u32 = 0o644;

/// Directory where freshly generated keypairs are saved as `<user>.key` / `<user>.key.pub`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store next to the running executable.
    pub fn beside_executable() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn private_key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }

    pub fn public_key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key.pub"))
    }

    /// Write both halves of a keypair. The private key must be present.
    pub async fn save(&self, keypair: &Keypair) -> Result<()> {
        let private_key =
            keypair
                .private_key
                .as_deref()
                .ok_or_else(|| VmError::KeypairCreation {
                    name: keypair.name.clone(),
                    detail: "the service returned no private key".into(),
                })?;

        write_key(&self.private_key_path(&keypair.name), private_key, PRIVATE_KEY_MODE).await?;
        write_key(
            &self.public_key_path(&keypair.name),
            &keypair.public_key,
            PUBLIC_KEY_MODE,
        )
        .await?;
        Ok(())
    }
}

async fn write_key(path: &Path, contents: &str, mode: u32) -> Result<()> {
    let write_failed = |source| VmError::FileWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(mode);

    let mut file = opts.open(path).await.map_err(write_failed)?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(write_failed)?;
    file.flush().await.map_err(write_failed)?;

    // Creation mode does not apply to a file that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(write_failed)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Outcome of [`ensure_keypair`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsuredKeypair {
    /// Already registered with the cloud. Local files were neither written nor checked.
    Existing(Keypair),
    /// Generated by the cloud and saved into the store directory.
    Created { keypair: Keypair, dir: PathBuf },
}

impl EnsuredKeypair {
    pub fn keypair(&self) -> &Keypair {
        match self {
            EnsuredKeypair::Existing(kp) => kp,
            EnsuredKeypair::Created { keypair, .. } => keypair,
        }
    }

    pub fn name(&self) -> &str {
        &self.keypair().name
    }
}

fn fingerprint(public_key: &str) -> Option<String> {
    PublicKey::from_openssh(public_key)
        .ok()
        .map(|k| k.fingerprint(HashAlg::Sha256).to_string())
}

/// Make sure a keypair named after `user_id` exists on the cloud.
///
/// A new keypair is persisted through `store`. If saving fails the remote keypair stays
/// registered, and later calls take the existing-keypair path without restoring the files.
pub async fn ensure_keypair<C: ComputeApi>(
    api: &C,
    user_id: &str,
    store: &KeyStore,
) -> Result<EnsuredKeypair> {
    if let Some(existing) = api.find_keypair(user_id).await? {
        info!(name = %existing.name, "using existing keypair");
        return Ok(EnsuredKeypair::Existing(existing));
    }

    let keypair = api
        .create_keypair(user_id)
        .await
        .map_err(|e| match e {
            created @ VmError::KeypairCreation { .. } => created,
            other => VmError::KeypairCreation {
                name: user_id.to_string(),
                detail: other.to_string(),
            },
        })?;

    match fingerprint(&keypair.public_key) {
        Some(fp) => info!(name = %keypair.name, fingerprint = %fp, "created keypair"),
        None => warn!(name = %keypair.name, "created keypair has an unparsable public key"),
    }

    store.save(&keypair).await?;
    info!(name = %keypair.name, dir = %store.dir().display(), "saved keypair");

    Ok(EnsuredKeypair::Created {
        keypair,
        dir: store.dir().to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryCompute;

    #[tokio::test]
    async fn creates_and_saves_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let api = MemoryCompute::new();

        let ensured = ensure_keypair(&api, "alice", &store).await.unwrap();
        assert!(matches!(ensured, EnsuredKeypair::Created { .. }));
        assert_eq!(ensured.name(), "alice");

        let private = std::fs::read_to_string(dir.path().join("alice.key")).unwrap();
        let public = std::fs::read_to_string(dir.path().join("alice.key.pub")).unwrap();
        assert!(private.contains("OPENSSH PRIVATE KEY"));
        assert_eq!(public, ensured.keypair().public_key);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = |p: &str| {
                std::fs::metadata(dir.path().join(p))
                    .unwrap()
                    .permissions()
                    .mode()
                    & 0o777
            };
            assert_eq!(mode("alice.key"), 0o600);
            assert_eq!(mode("alice.key.pub"), 0o644);
        }
    }

    #[tokio::test]
    async fn existing_keypair_is_reused_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let api = MemoryCompute::new().with_keypair("bob", "ssh-ed25519 AAAA bob");

        for _ in 0..3 {
            let ensured = ensure_keypair(&api, "bob", &store).await.unwrap();
            assert!(matches!(ensured, EnsuredKeypair::Existing(_)));
        }
        assert!(api.calls().create_keypair.is_empty());
        assert!(!store.private_key_path("bob").exists());
    }

    #[tokio::test]
    async fn repeated_calls_create_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let api = MemoryCompute::new();

        ensure_keypair(&api, "carol", &store).await.unwrap();
        std::fs::remove_file(store.private_key_path("carol")).unwrap();
        let again = ensure_keypair(&api, "carol", &store).await.unwrap();

        assert!(matches!(again, EnsuredKeypair::Existing(_)));
        assert_eq!(api.calls().create_keypair, vec!["carol".to_string()]);
        assert!(!store.private_key_path("carol").exists());
    }

    #[tokio::test]
    async fn remote_failure_is_a_creation_error() {
        let dir = tempfile::tempdir().unwrap();
        let api = MemoryCompute::new().fail_keypairs();
        let err = ensure_keypair(&api, "dave", &KeyStore::new(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::KeypairCreation { ref name, .. } if name == "dave"));
    }

    #[tokio::test]
    async fn unwritable_directory_leaves_remote_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("missing"));
        let api = MemoryCompute::new();

        let err = ensure_keypair(&api, "erin", &store).await.unwrap_err();
        assert!(matches!(err, VmError::FileWrite { .. }));
        assert!(api.find_keypair("erin").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_requires_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let kp = Keypair {
            name: "frank".into(),
            public_key: "ssh-ed25519 AAAA".into(),
            private_key: None,
            fingerprint: None,
        };
        assert!(matches!(
            store.save(&kp).await,
            Err(VmError::KeypairCreation { .. })
        ));
    }

    #[test]
    fn key_paths() {
        let store = KeyStore::new("/keys");
        assert_eq!(store.private_key_path("u1"), PathBuf::from("/keys/u1.key"));
        assert_eq!(store.public_key_path("u1"), PathBuf::from("/keys/u1.key.pub"));
    }
}
