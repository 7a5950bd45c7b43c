//! Challenge-response authentication.
//!
//! The server sends 16 random bytes; the client answers with
//! HMAC-SHA1(password, challenge). An empty password is a valid key.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;

use super::protocol::{CHALLENGE_LEN, RESPONSE_LEN};

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, thiserror::Error)]
#[error("invalid HMAC key length")]
pub struct InvalidKey;

/// Fresh random challenge from the OS generator.
pub fn new_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

pub fn compute_response(
    password: &str,
    challenge: &[u8; CHALLENGE_LEN],
) -> Result<[u8; RESPONSE_LEN], InvalidKey> {
    let mut mac = HmacSha1::new_from_slice(password.as_bytes()).map_err(|_| InvalidKey)?;
    mac.update(challenge);
    let mut response = [0u8; RESPONSE_LEN];
    response.copy_from_slice(&mac.finalize().into_bytes());
    Ok(response)
}

/// Constant-time check of a client's response.
pub fn verify_response(
    password: &str,
    challenge: &[u8; CHALLENGE_LEN],
    response: &[u8; RESPONSE_LEN],
) -> bool {
    let Ok(mut mac) = HmacSha1::new_from_slice(password.as_bytes()) else {
        return false;
    };
    mac.update(challenge);
    mac.verify_slice(response).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn counting_challenge() -> [u8; CHALLENGE_LEN] {
        let mut c = [0u8; CHALLENGE_LEN];
        for (i, b) in c.iter_mut().enumerate() {
            *b = i as u8;
        }
        c
    }

    #[test]
    fn response_matches_known_vector() {
        let response = compute_response("secret", &counting_challenge()).unwrap();
        insta::assert_snapshot!(hex(&response), @"07b65372af1decffb9644a24f05c631194b54a91");
    }

    #[test]
    fn empty_password_is_a_valid_key() {
        let response = compute_response("", &counting_challenge()).unwrap();
        insta::assert_snapshot!(hex(&response), @"7eccef867c23c0130708adfd2989fdac5a9d508d");
    }

    #[test]
    fn verify_accepts_matching_password() {
        let challenge = new_challenge();
        let response = compute_response("hunter2", &challenge).unwrap();
        assert!(verify_response("hunter2", &challenge, &response));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let challenge = new_challenge();
        let response = compute_response("hunter2", &challenge).unwrap();
        assert!(!verify_response("hunter3", &challenge, &response));
    }

    #[test]
    fn verify_rejects_other_challenge() {
        let response = compute_response("pw", &counting_challenge()).unwrap();
        let mut other = counting_challenge();
        other[0] ^= 0xFF;
        assert!(!verify_response("pw", &other, &response));
    }

    #[test]
    fn challenges_differ() {
        assert_ne!(new_challenge(), new_challenge());
    }
}
