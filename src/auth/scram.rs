//! SCRAM-SHA-256 and SCRAM-SHA-256-PLUS client (RFC 5802 / RFC 7677).

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// GS2 channel-binding choice for this authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelBinding {
    /// `n,,` - the client does not bind the channel (no TLS, or the server
    /// only offers plain SCRAM-SHA-256).
    None,
    /// `p=tls-server-end-point,,` with the SHA-256 of the server's
    /// DER-encoded end-entity certificate (SCRAM-SHA-256-PLUS).
    TlsServerEndPoint([u8; 32]),
}

impl ChannelBinding {
    pub fn gs2_header(&self) -> &'static str {
        match self {
            ChannelBinding::None => "n,,",
            ChannelBinding::TlsServerEndPoint(_) => "p=tls-server-end-point,,",
        }
    }

    /// The `c=` attribute: base64 of the cbind-input (gs2 header plus the
    /// certificate hash when binding).
    pub fn cbind_encoded(&self) -> String {
        let mut input = Vec::from(self.gs2_header().as_bytes());
        if let ChannelBinding::TlsServerEndPoint(hash) = self {
            input.extend_from_slice(hash);
        }
        B64.encode(input)
    }

    /// The SASL mechanism this binding goes with.
    pub fn mechanism(&self) -> &'static str {
        match self {
            ChannelBinding::None => "SCRAM-SHA-256",
            ChannelBinding::TlsServerEndPoint(_) => "SCRAM-SHA-256-PLUS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScramClient {
    channel_binding: ChannelBinding,
    pub client_nonce_b64: String,
    pub client_first_bare: String,
    pub client_first: String,
}

impl ScramClient {
    /// Create a client with a random 18-byte nonce.
    pub fn new(username: &str, channel_binding: ChannelBinding) -> ScramClient {
        let mut nonce = [0u8; 18];
        rand::rng().fill_bytes(&mut nonce);
        Self::with_nonce(username, channel_binding, &B64.encode(nonce))
    }

    /// Create a client with a caller-supplied nonce (deterministic tests).
    pub fn with_nonce(
        username: &str,
        channel_binding: ChannelBinding,
        nonce_b64: &str,
    ) -> ScramClient {
        let user = sasl_escape_username(username);
        let client_first_bare = format!("n={user},r={nonce_b64}");
        let client_first = format!("{}{client_first_bare}", channel_binding.gs2_header());

        ScramClient {
            channel_binding,
            client_nonce_b64: nonce_b64.to_string(),
            client_first_bare,
            client_first,
        }
    }

    pub fn parse_server_first(server_first: &str) -> Result<(String, String, u32)> {
        let mut r = None;
        let mut s = None;
        let mut i = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                r = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                s = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("i=") {
                i = v.parse::<u32>().ok();
            }
        }
        Ok((
            r.ok_or_else(|| Error::Forbidden("SCRAM server-first missing r".into()))?,
            s.ok_or_else(|| Error::Forbidden("SCRAM server-first missing s".into()))?,
            i.ok_or_else(|| Error::Forbidden("SCRAM server-first missing i".into()))?,
        ))
    }

    /// Compute the client-final-message for a received server-first-message.
    ///
    /// Returns the message, the RFC 5802 AuthMessage, and the salted
    /// password (both needed to verify the server signature afterwards).
    pub fn client_final(
        &self,
        password: &str,
        server_first: &str,
    ) -> Result<(String, String, Vec<u8>)> {
        let (rnonce, salt_b64, iterations) = Self::parse_server_first(server_first)?;
        if !rnonce.starts_with(&self.client_nonce_b64) {
            return Err(Error::Forbidden("SCRAM nonce mismatch".into()));
        }
        let salt = B64
            .decode(salt_b64.as_bytes())
            .map_err(|e| Error::Forbidden(format!("bad SCRAM salt b64: {e}")))?;

        let client_final_wo_proof =
            format!("c={},r={rnonce}", self.channel_binding.cbind_encoded());
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_wo_proof
        );

        let salted_password = hi_sha256(password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let client_sig = hmac_sha256(stored_key.as_slice(), auth_message.as_bytes());
        let proof = xor_bytes(&client_key, &client_sig);
        let proof_b64 = B64.encode(proof);

        let client_final = format!("{client_final_wo_proof},p={proof_b64}");
        Ok((client_final, auth_message, salted_password))
    }

    /// Verify the server signature of the final SASL message. A mismatch
    /// means the server never knew the password.
    pub fn verify_server_final(
        server_final: &str,
        salted_password: &[u8],
        auth_message: &str,
    ) -> Result<()> {
        if let Some(e) = server_final
            .split(',')
            .find_map(|p| p.strip_prefix("e="))
        {
            return Err(Error::Forbidden(format!("SCRAM server error: {e}")));
        }
        let v = server_final
            .split(',')
            .find_map(|p| p.strip_prefix("v="))
            .ok_or_else(|| Error::Forbidden("SCRAM server-final missing v".into()))?;
        let server_sig = B64
            .decode(v.trim().as_bytes())
            .map_err(|e| Error::Forbidden(format!("bad server signature b64: {e}")))?;

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if server_sig != expected {
            return Err(Error::Forbidden("SCRAM server signature mismatch".into()));
        }
        Ok(())
    }
}

fn sasl_escape_username(u: &str) -> String {
    u.replace('=', "=3D").replace(',', "=2C")
}

fn hi_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    // RFC5802 Hi(): U1 = HMAC(p, salt + INT(1)), U2 = HMAC(p, U1) ... XOR
    let mut s1 = Vec::with_capacity(salt.len() + 4);
    s1.extend_from_slice(salt);
    s1.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password, &s1);
    let mut out = u.clone();

    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (o, ui) in out.iter_mut().zip(u.iter()) {
            *o ^= *ui;
        }
    }
    out
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}
