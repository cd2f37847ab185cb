//! File-backed [`ntp_transport::KeystoreStore`]. The wire format (JSON,
//! base64url, reversed, XORed) is entirely `ntp_transport::Keystore`'s
//! concern; this just reads and writes the bytes.

use ntp_transport::{Keystore, KeystoreStore};
use std::path::PathBuf;
use tracing::warn;

pub struct FileKeystoreStore {
    path: PathBuf,
}

impl FileKeystoreStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl KeystoreStore for FileKeystoreStore {
    async fn save(&self, keystore: &Keystore) {
        if let Err(e) = tokio::fs::write(&self.path, keystore.serialize()).await {
            warn!(error = %e, path = %self.path.display(), "failed to persist keystore");
        }
    }

    async fn load(&self) -> Option<Keystore> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        match Keystore::deserialize(&bytes) {
            Ok(ks) => Some(ks),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "stored keystore is malformed, ignoring");
                None
            }
        }
    }

    async fn delete(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "failed to delete keystore"),
        }
    }
}
