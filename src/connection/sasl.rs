//! SCRAM-SHA-256 client exchange, per RFC 5802 / RFC 7677.
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::postgres::ProtocolError;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

const NONCE_LEN: usize = 18;
/// base64 of the GS2 header `n,,` (no channel binding).
const GS2_BASE64: &str = "biws";

type HmacSha256 = Hmac<Sha256>;

/// Client side of one SCRAM exchange.
///
/// `client_first` → server challenge → [`Self::continue_with`] →
/// server final → [`Self::verify_final`].
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
    server_signature: Option<[u8; 32]>,
}

impl ScramClient {
    /// Postgres takes the username from the startup message, so the
    /// SCRAM username is left empty.
    pub fn new(password: &str) -> Self {
        let mut raw = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut raw);
        Self::with_nonce("", password, BASE64.encode(raw))
    }

    fn with_nonce(username: &str, password: &str, nonce: String) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            nonce,
            server_signature: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    /// The client-first message, GS2 header included.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare())
    }

    /// Answer the `SASLContinue` challenge; returns the client-final
    /// message carrying the proof.
    pub fn continue_with(&mut self, server_first: &str) -> Result<String, ProtocolError> {
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_at_checked(2) {
                Some(("r=", v)) => server_nonce = Some(v),
                Some(("s=", v)) => salt = Some(v),
                Some(("i=", v)) => iterations = v.parse::<u32>().ok(),
                _ => { },
            }
        }
        let (Some(server_nonce), Some(salt), Some(iterations)) =
            (server_nonce, salt, iterations)
        else {
            return Err(ProtocolError::new("malformed SCRAM server-first message"));
        };

        if !server_nonce.starts_with(self.nonce.as_str()) {
            return Err(ProtocolError::new("SCRAM server nonce does not extend ours"));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|_| ProtocolError::new("malformed SCRAM salt"))?;

        let salted_password = pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(
            self.password.as_bytes(),
            &salt,
            iterations,
        );

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={GS2_BASE64},r={server_nonce}");
        let auth_message = format!(
            "{},{server_first},{without_proof}",
            self.client_first_bare(),
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        let server_key = hmac(&salted_password, b"Server Key");
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes()));

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Check the server signature from `SASLFinal`; a mismatch means the
    /// server never knew the password.
    pub fn verify_final(&self, server_final: &str) -> Result<(), ProtocolError> {
        let signature = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| ProtocolError::new("malformed SCRAM server-final message"))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| ProtocolError::new("malformed SCRAM server signature"))?;

        match &self.server_signature {
            Some(expected) if expected[..] == signature[..] => Ok(()),
            _ => Err(ProtocolError::new("SCRAM server signature mismatch")),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
