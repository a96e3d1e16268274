use crate::keys::Keys;

/// A peer's published key material, fetched from the server when an
/// outbound session must be created.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    /// One-time prekey, if the peer's pool was not exhausted.
    pub pre_key_id: Option<u32>,
    pub pre_key: Option<[u8; 32]>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub identity_key: [u8; 32],
}

impl PreKeyBundle {
    /// This device's own bundle material: what the server would hand
    /// to a peer initiating a session with us. The referenced prekey
    /// stays in the store; only an incoming prekey message consumes it.
    pub fn for_local_device(keys: &Keys, pre_key_id: Option<u32>) -> Self {
        let pre_key = pre_key_id
            .and_then(|id| keys.find_pre_key(id))
            .map(|pk| pk.key_pair.public_key);
        Self {
            registration_id: keys.id,
            pre_key_id: pre_key_id.filter(|_| pre_key.is_some()),
            pre_key,
            signed_pre_key_id: keys.signed_pre_key.id,
            signed_pre_key: keys.signed_pre_key.key_pair.public_key,
            signed_pre_key_signature: keys.signed_pre_key.signature,
            identity_key: keys.identity_key_pair.public_key,
        }
    }
}
