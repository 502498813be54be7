use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies review-link tokens with HMAC-SHA256 over
/// `token + "." + expires_at_millis`. The key is injected at construction
/// and shared between the sweep worker (signer) and the HTTP verifier.
pub struct LinkSigner {
    secret: Vec<u8>,
}

impl LinkSigner {
    pub fn new(secret: &str) -> LinkSigner {
        LinkSigner {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn sign(&self, token: &str, expires_at_millis: i64) -> String {
        hex::encode(self.mac(token, expires_at_millis).finalize().into_bytes())
    }

    /// Constant-time verification via `Mac::verify_slice`. The expiry must
    /// come from the stored job record, never from the client.
    pub fn verify(&self, token: &str, expires_at_millis: i64, signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };

        self.mac(token, expires_at_millis)
            .verify_slice(&signature)
            .is_ok()
    }

    fn mac(&self, token: &str, expires_at_millis: i64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(token.as_bytes());
        mac.update(b".");
        mac.update(expires_at_millis.to_string().as_bytes());
        mac
    }
}
