use std::fs;
use std::path::{Path, PathBuf};

use libp2p::identity::{self, Keypair};

use crate::error::{Error, PersistenceErrorKind};

const IDENTITY_FILE: &str = "identity.key";

/// Loads the relay's long-term ed25519 identity from `<dir>/identity.key`,
/// generating and persisting a fresh one when the file is absent or
/// `regenerate` is set. The key file is written with mode 0600.
pub fn load_or_generate(dir: &Path, regenerate: bool) -> Result<Keypair, Error> {
    let path = identity_path(dir);

    if !regenerate && path.exists() {
        tracing::info!("Loading existing relay identity from {}", path.display());
        return load(&path);
    }

    fs::create_dir_all(dir).map_err(|e| {
        Error::new_persistence(
            format!("failed to create persist dir {}: {}", dir.display(), e),
            PersistenceErrorKind::Identity,
        )
    })?;

    tracing::info!("Generating new relay identity");
    let keypair = Keypair::generate_ed25519();
    save(&keypair, &path)?;
    tracing::info!("New identity saved to {}", path.display());

    Ok(keypair)
}

pub fn identity_path(dir: &Path) -> PathBuf {
    dir.join(IDENTITY_FILE)
}

fn load(path: &Path) -> Result<Keypair, Error> {
    let mut bytes = fs::read(path).map_err(|e| {
        Error::new_persistence(
            format!("failed to read identity key {}: {}", path.display(), e),
            PersistenceErrorKind::Identity,
        )
    })?;

    let ed25519 = identity::ed25519::Keypair::try_from_bytes(&mut bytes).map_err(|e| {
        Error::new_persistence(
            format!("identity key {} is corrupt: {}", path.display(), e),
            PersistenceErrorKind::Identity,
        )
    })?;

    Ok(ed25519.into())
}

fn save(keypair: &Keypair, path: &Path) -> Result<(), Error> {
    let ed25519 = keypair.clone().try_into_ed25519().map_err(|e| {
        Error::new_persistence(
            format!("identity key is not ed25519: {}", e),
            PersistenceErrorKind::Identity,
        )
    })?;

    fs::write(path, ed25519.to_bytes()).map_err(|e| {
        Error::new_persistence(
            format!("failed to write identity key {}: {}", path.display(), e),
            PersistenceErrorKind::Identity,
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
            Error::new_persistence(
                format!("failed to restrict identity key permissions: {}", e),
                PersistenceErrorKind::Identity,
            )
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate(dir.path(), false).unwrap();
        let second = load_or_generate(dir.path(), false).unwrap();
        assert_eq!(
            first.public().to_peer_id(),
            second.public().to_peer_id()
        );
    }

    #[test]
    fn regenerate_replaces_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate(dir.path(), false).unwrap();
        let second = load_or_generate(dir.path(), true).unwrap();
        assert_ne!(
            first.public().to_peer_id(),
            second.public().to_peer_id()
        );
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        load_or_generate(dir.path(), false).unwrap();
        let mode = fs::metadata(identity_path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
