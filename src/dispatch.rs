//! Routes inbound and outbound ciphertext between the transport and
//! the session layer.
//!
//! Concurrency model: single writer over the key store. Every mutation
//! goes through one `tokio::sync::RwLock`; the crypto inside the lock
//! is synchronous and non-suspending, while network fetches (prekey
//! bundles, external blobs) and durable saves happen outside it, so
//! cancellation at any `.await` never leaves partial state behind.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::appstate::patch::{ExternalBlobReference, SyncdPatch, SyncdSnapshot};
use crate::appstate::processor::{ExternalBlobFetcher, fetch_external_snapshot};
use crate::appstate::{AppStateSyncKey, Mutation, Processor};
use crate::config::Config;
use crate::error::ClientError;
use crate::keys::prefs::Preferences;
use crate::keys::Keys;
use crate::signal::groups::{GroupCipher, GroupSessionBuilder};
use crate::signal::message::SenderKeyDistributionMessage;
use crate::signal::{
    MessageKind, PreKeyBundle, SenderKeyName, SessionAddress, SessionCipher, SignalProtocolError,
};
use crate::transport;

type Result<T> = std::result::Result<T, ClientError>;

/// Fetches a peer's prekey bundle from the server; implemented by the
/// transport layer, stubbed in tests.
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    async fn fetch_bundle(
        &self,
        address: &SessionAddress,
    ) -> std::result::Result<PreKeyBundle, Box<dyn std::error::Error + Send + Sync>>;
}

pub struct Dispatcher {
    keys: Arc<RwLock<Keys>>,
    processor: Mutex<Processor>,
    prefs: Preferences,
    config: Config,
}

impl Dispatcher {
    /// Loads (or allocates) the keys for `config.id` and wires the
    /// dispatcher around them.
    pub async fn new(config: Config, prefs: Preferences) -> Result<Self> {
        if !config.is_protocol_compatible() {
            log::warn!("config overrides protocol-pinned limits; peers will not honor them");
        }
        let loaded = {
            let prefs = prefs.clone();
            let id = config.id;
            tokio::task::spawn_blocking(move || Keys::load(&prefs, id))
                .await
                .expect("keys loading task must not panic")?
        };
        let mut keys = loaded;
        if !keys.has_pre_keys() {
            keys.generate_pre_keys(config.pre_key_batch);
        }
        Ok(Self {
            keys: Arc::new(RwLock::new(keys)),
            processor: Mutex::new(Processor::new()),
            prefs,
            config,
        })
    }

    /// Shared handle to the key store, for pairing flows and tests.
    pub fn keys(&self) -> Arc<RwLock<Keys>> {
        Arc::clone(&self.keys)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // --- message paths ---------------------------------------------------

    /// Decrypts one inbound frame. `skmsg` frames additionally carry
    /// the group id they were sent to.
    pub async fn process_inbound(
        &self,
        kind: MessageKind,
        from: &SessionAddress,
        group: Option<&str>,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let mut keys = self.keys.write().await;
        let plaintext = match kind {
            MessageKind::PreKey => {
                SessionCipher::new(&mut keys, from.clone()).decrypt_prekey_message(payload)?
            }
            MessageKind::Whisper => {
                SessionCipher::new(&mut keys, from.clone()).decrypt_message(payload)?
            }
            MessageKind::SenderKey => {
                let group = group.ok_or(SignalProtocolError::InvalidMessage(
                    "skmsg without a group id",
                ))?;
                let name = SenderKeyName::new(group, from.clone());
                GroupCipher::new(&mut keys, name).decrypt(payload)?
            }
        };
        Ok(plaintext)
    }

    /// Encrypts one outbound payload. With a group id the payload is
    /// sealed under our sender key; otherwise over the pairwise session.
    pub async fn process_outbound(
        &self,
        to: &SessionAddress,
        group: Option<&str>,
        plaintext: &[u8],
    ) -> Result<(MessageKind, Vec<u8>)> {
        let mut keys = self.keys.write().await;
        match group {
            Some(group) => {
                let name = SenderKeyName::new(group, to.clone());
                let message = GroupCipher::new(&mut keys, name).encrypt(plaintext)?;
                Ok((MessageKind::SenderKey, message.serialized().to_vec()))
            }
            None => {
                let (kind, frame) =
                    SessionCipher::new(&mut keys, to.clone()).encrypt(plaintext)?;
                Ok((kind, frame))
            }
        }
    }

    /// Ensures a pairwise session toward `to` exists, fetching the peer
    /// bundle when needed. The fetch awaits outside the store lock.
    pub async fn ensure_outbound_session(
        &self,
        to: &SessionAddress,
        fetcher: &dyn BundleFetcher,
    ) -> Result<()> {
        if self.keys.read().await.has_session(to) {
            return Ok(());
        }
        let bundle = match fetcher.fetch_bundle(to).await {
            Ok(bundle) => bundle,
            Err(e) => {
                log::warn!("prekey bundle fetch for {to} failed: {e}");
                return Err(SignalProtocolError::InvalidMessage("bundle fetch failed").into());
            }
        };
        let mut keys = self.keys.write().await;
        if !keys.has_session(to) {
            SessionCipher::new(&mut keys, to.clone()).process_bundle(&bundle)?;
        }
        Ok(())
    }

    /// Returns the distribution message to send before the first group
    /// message for `name`, or None when it already went out. The caller
    /// confirms the send with [`Dispatcher::confirm_distribution`].
    pub async fn distribution_for(
        &self,
        name: &SenderKeyName,
    ) -> Result<Option<SenderKeyDistributionMessage>> {
        let mut keys = self.keys.write().await;
        if keys.has_receiver_key(name) {
            return Ok(None);
        }
        let message = GroupSessionBuilder::new(&mut keys).create_distribution_message(name)?;
        Ok(Some(message))
    }

    pub async fn confirm_distribution(&self, name: SenderKeyName) {
        self.keys.write().await.mark_receiver_key(name);
    }

    /// Ingests a peer's distribution message.
    pub async fn process_distribution(
        &self,
        name: &SenderKeyName,
        payload: &[u8],
    ) -> Result<()> {
        let message = SenderKeyDistributionMessage::try_from(payload)?;
        let mut keys = self.keys.write().await;
        GroupSessionBuilder::new(&mut keys).process_distribution_message(name, &message);
        Ok(())
    }

    // --- app state -------------------------------------------------------

    pub async fn process_app_state_patch(
        &self,
        name: &str,
        patch: &SyncdPatch,
    ) -> Result<Vec<Mutation>> {
        let mut processor = self.processor.lock().await;
        let mut keys = self.keys.write().await;
        Ok(processor.process_patch(&mut keys, name, patch)?)
    }

    pub async fn process_app_state_snapshot(
        &self,
        name: &str,
        snapshot: &SyncdSnapshot,
    ) -> Result<Vec<Mutation>> {
        let mut processor = self.processor.lock().await;
        let mut keys = self.keys.write().await;
        Ok(processor.process_snapshot(&mut keys, name, snapshot)?)
    }

    /// Registers a sync key and replays any patches parked on it.
    pub async fn provide_app_state_key(&self, key: AppStateSyncKey) -> Result<Vec<Mutation>> {
        let mut processor = self.processor.lock().await;
        let mut keys = self.keys.write().await;
        Ok(processor.provide_key(&mut keys, key)?)
    }

    /// Fetches, decrypts and applies an externally stored snapshot.
    /// The download awaits outside the store lock.
    pub async fn apply_external_snapshot(
        &self,
        name: &str,
        reference: &ExternalBlobReference,
        fetcher: &dyn ExternalBlobFetcher,
    ) -> Result<Vec<Mutation>> {
        let snapshot = fetch_external_snapshot(fetcher, reference).await?;
        self.process_app_state_snapshot(name, &snapshot).await
    }

    // --- transport -------------------------------------------------------

    pub async fn encrypt_transport(&self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let mut keys = self.keys.write().await;
        Ok(transport::encrypt_transport(&mut keys, plaintext, ad)?)
    }

    pub async fn decrypt_transport(&self, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let mut keys = self.keys.write().await;
        Ok(transport::decrypt_transport(&mut keys, ciphertext, ad)?)
    }

    // --- persistence -----------------------------------------------------

    /// Serializes the key store. `background` offloads the write to the
    /// blocking pool; otherwise it completes before returning.
    pub async fn save(&self, background: bool) -> Result<()> {
        let snapshot = self.keys.read().await.clone();
        let prefs = self.prefs.clone();
        if background {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = snapshot.save(&prefs) {
                    log::error!("background keys save failed: {e}");
                }
            });
            Ok(())
        } else {
            let result = tokio::task::spawn_blocking(move || snapshot.save(&prefs))
                .await
                .expect("keys saving task must not panic");
            Ok(result?)
        }
    }

    /// Clears the preferences root, forgetting every stored key set.
    pub async fn delete_all(&self) -> Result<()> {
        let prefs = self.prefs.clone();
        let result = tokio::task::spawn_blocking(move || prefs.delete_all())
            .await
            .expect("prefs deletion task must not panic");
        result.map_err(|e| ClientError::Keys(crate::keys::KeysError::Persistence(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn dispatcher(id: u32, dir: &tempfile::TempDir) -> Dispatcher {
        let prefs = Preferences::at(dir.path().join(format!("d{id}"))).unwrap();
        Dispatcher::new(Config::new(id), prefs).await.unwrap()
    }

    struct StaticBundle(PreKeyBundle);

    #[async_trait]
    impl BundleFetcher for StaticBundle {
        async fn fetch_bundle(
            &self,
            _address: &SessionAddress,
        ) -> std::result::Result<PreKeyBundle, Box<dyn std::error::Error + Send + Sync>>
        {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn new_dispatcher_seeds_prekeys() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(1, &dir).await;
        let keys = dispatcher.keys();
        let keys = keys.read().await;
        assert_eq!(keys.pre_keys.len(), 30);
    }

    #[tokio::test]
    async fn pairwise_flow_through_dispatchers() {
        let dir = tempfile::tempdir().unwrap();
        let alice = dispatcher(1, &dir).await;
        let bob = dispatcher(2, &dir).await;

        let bundle = {
            let keys = bob.keys();
            let keys = keys.read().await;
            PreKeyBundle::for_local_device(&keys, Some(1))
        };
        let bob_address = SessionAddress::new("bob", 0);
        let alice_address = SessionAddress::new("alice", 0);

        alice
            .ensure_outbound_session(&bob_address, &StaticBundle(bundle))
            .await
            .unwrap();
        let (kind, frame) = alice
            .process_outbound(&bob_address, None, b"hello")
            .await
            .unwrap();
        assert_eq!(kind, MessageKind::PreKey);

        let plaintext = bob
            .process_inbound(kind, &alice_address, None, &frame)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[tokio::test]
    async fn group_flow_through_dispatchers() {
        let dir = tempfile::tempdir().unwrap();
        let alice = dispatcher(1, &dir).await;
        let bob = dispatcher(2, &dir).await;

        let alice_address = SessionAddress::new("alice", 0);
        let name = SenderKeyName::new("group@g.us", alice_address.clone());

        let distribution = alice.distribution_for(&name).await.unwrap().unwrap();
        alice.confirm_distribution(name.clone()).await;
        assert!(alice.distribution_for(&name).await.unwrap().is_none());

        bob.process_distribution(&name, distribution.serialized())
            .await
            .unwrap();

        let (kind, frame) = alice
            .process_outbound(&alice_address, Some("group@g.us"), b"to the group")
            .await
            .unwrap();
        assert_eq!(kind, MessageKind::SenderKey);
        let plaintext = bob
            .process_inbound(kind, &alice_address, Some("group@g.us"), &frame)
            .await
            .unwrap();
        assert_eq!(plaintext, b"to the group");
    }

    #[tokio::test]
    async fn skmsg_without_group_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bob = dispatcher(2, &dir).await;
        let err = bob
            .process_inbound(
                MessageKind::SenderKey,
                &SessionAddress::new("alice", 0),
                None,
                &[0x33],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Signal(SignalProtocolError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn save_roundtrips_through_prefs() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::at(dir.path().join("state")).unwrap();
        let dispatcher = Dispatcher::new(Config::new(9), prefs.clone()).await.unwrap();
        dispatcher.save(false).await.unwrap();
        assert_eq!(prefs.known_ids().unwrap(), vec![9]);
        let reloaded = Keys::load(&prefs, 9).unwrap();
        assert_eq!(reloaded.pre_keys.len(), 30);
    }
}
