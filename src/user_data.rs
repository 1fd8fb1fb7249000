//! Rendezvous value carried in discovery user data.
//!
//! Nodes of one application announce `kvm-fabric=<digest>`, where the digest
//! is the first 16 hex characters of the SHA-256 of the application id.
//! Peers announcing anything else belong to a different fabric.

use iroh::discovery::UserData;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const RENDEZVOUS_KEY: &str = "kvm-fabric";
const DIGEST_HEX_LEN: usize = 16;

/// Rendezvous text for an application id.
pub fn rendezvous_for(application_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(application_id.as_bytes()));
    format!("{RENDEZVOUS_KEY}={}", &digest[..DIGEST_HEX_LEN])
}

/// Discovery user data announcing an application id.
pub fn encode_rendezvous(application_id: &str) -> Result<UserData> {
    rendezvous_for(application_id)
        .parse()
        .map_err(|e| Error::Discovery(format!("invalid user data: {e}")))
}

/// Whether announced user data matches the rendezvous of `application_id`.
pub fn user_data_has_rendezvous(user_data: &UserData, application_id: &str) -> bool {
    let announced: &str = user_data.as_ref();
    announced == rendezvous_for(application_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_is_stable_and_short() {
        let value = rendezvous_for("kvm");
        assert_eq!(value, rendezvous_for("kvm"));
        assert!(value.starts_with("kvm-fabric="));
        assert_eq!(value.len(), "kvm-fabric=".len() + 16);
        assert_ne!(value, rendezvous_for("kvm2"));
    }

    #[test]
    fn matching_is_exact() {
        let mine = encode_rendezvous("office").unwrap();
        assert!(user_data_has_rendezvous(&mine, "office"));
        assert!(!user_data_has_rendezvous(&mine, "lab"));

        let other: UserData = "something-else".parse().unwrap();
        assert!(!user_data_has_rendezvous(&other, "office"));
    }
}
