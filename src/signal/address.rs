use serde::{Deserialize, Serialize};
use std::fmt;

/// The address of one remote device: user id plus device id.
/// Equality is structural; addresses key the session map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionAddress {
    user: String,
    device: u8,
}

impl SessionAddress {
    pub fn new(user: impl Into<String>, device: u8) -> Self {
        Self {
            user: user.into(),
            device,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn device(&self) -> u8 {
        self.device
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.device)
    }
}

/// Identifies one sender's ratchet inside one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderKeyName {
    group_id: String,
    sender: SessionAddress,
}

impl SenderKeyName {
    pub fn new(group_id: impl Into<String>, sender: SessionAddress) -> Self {
        Self {
            group_id: group_id.into(),
            sender,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn sender(&self) -> &SessionAddress {
        &self.sender
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group_id, self.sender)
    }
}
