//! NTLM token generation for the three-message proxy exchange, plus the
//! process-wide scratch pool used for base64 work on tokens.
//!
//! The cryptography lives in the `sspi` crate; this module only drives the
//! Negotiate / Challenge / Authenticate sequence and shuttles tokens in and
//! out of `Proxy-Authorization` / `Proxy-Authenticate` headers.

use crate::error::ProxyError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::HeaderValue;
use sspi::builders::EmptyInitializeSecurityContext;
use sspi::{
    AuthIdentity, ClientRequestFlags, CredentialUse, DataRepresentation, Ntlm, SecurityBuffer,
    SecurityBufferType, SecurityStatus, Sspi, SspiImpl,
};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Upper bound of an NTLM token (the SSPI package's cbMaxToken).
pub const MAX_TOKEN_LEN: usize = 2888;

static TOKEN_POOL: TokenPool = TokenPool::new();

/// Reusable byte buffers sized for NTLM tokens. Buffers grow on demand and
/// are never shrunk; returning happens on scope exit.
struct TokenPool {
    slots: Mutex<Vec<Vec<u8>>>,
}

impl TokenPool {
    const fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    fn get(&'static self) -> TokenBuf {
        let buf = self
            .slots
            .lock()
            .expect("token pool poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; MAX_TOKEN_LEN]);
        TokenBuf { buf, pool: self }
    }
}

pub struct TokenBuf {
    buf: Vec<u8>,
    pool: &'static TokenPool,
}

impl Deref for TokenBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for TokenBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for TokenBuf {
    fn drop(&mut self) {
        let mut slots = match self.pool.slots.lock() {
            Ok(slots) => slots,
            Err(_) => return,
        };
        slots.push(mem::take(&mut self.buf));
    }
}

/// Borrow a scratch buffer from the pool.
pub fn token_buf() -> TokenBuf {
    TOKEN_POOL.get()
}

/// Render an NTLM token as a `Proxy-Authorization` header value.
pub fn encode_auth_header(token: &[u8]) -> Result<HeaderValue, ProxyError> {
    let mut scratch = token_buf();
    let need = (token.len() + 2) / 3 * 4;
    if scratch.len() < need {
        scratch.resize(need, 0);
    }
    let n = STANDARD
        .encode_slice(token, &mut scratch[..need])
        .map_err(|e| ProxyError::Decode(format!("token encode: {}", e)))?;
    let text = std::str::from_utf8(&scratch[..n])
        .map_err(|e| ProxyError::Decode(format!("token encode: {}", e)))?;
    HeaderValue::from_str(&format!("NTLM {}", text))
        .map_err(|e| ProxyError::Decode(format!("token encode: {}", e)))
}

/// Extract and decode the server challenge from a `Proxy-Authenticate`
/// header value of the form `NTLM <base64>`.
pub fn decode_challenge(header: &str) -> Result<Vec<u8>, ProxyError> {
    let encoded = header
        .strip_prefix("NTLM ")
        .ok_or_else(|| ProxyError::Decode(format!("unknown Proxy-Authenticate: {}", header)))?
        .trim();
    let mut scratch = token_buf();
    let need = encoded.len() / 4 * 3 + 3;
    if scratch.len() < need {
        scratch.resize(need, 0);
    }
    let n = STANDARD
        .decode_slice(encoded.as_bytes(), &mut scratch[..])
        .map_err(|e| ProxyError::Decode(format!("cannot decode challenge: {}", e)))?;
    Ok(scratch[..n].to_vec())
}

/// A per-connection NTLM client context. Created at the start of a `dial` or
/// HTTP exchange, discarded once the handshake resolves either way.
pub struct NtlmSession {
    ntlm: Ntlm,
    creds: <Ntlm as SspiImpl>::CredentialsHandle,
    target: String,
}

impl NtlmSession {
    pub fn new(identity: &AuthIdentity, target: &str) -> Result<Self, ProxyError> {
        let mut ntlm = Ntlm::new();
        let acq = ntlm
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(identity)
            .execute()?;
        Ok(Self {
            ntlm,
            creds: acq.credentials_handle,
            target: target.to_string(),
        })
    }

    /// Produce the Type-1 (Negotiate) token.
    pub fn negotiate(&mut self) -> Result<Vec<u8>, ProxyError> {
        self.step(None)
    }

    /// Feed the Type-2 challenge, producing the Type-3 (Authenticate) token.
    pub fn authenticate(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.step(Some(challenge))
    }

    fn step(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, ProxyError> {
        let mut output = vec![SecurityBuffer::new(Vec::new(), SecurityBufferType::Token)];
        let result = if let Some(token) = input {
            let mut input_token = vec![SecurityBuffer::new(
                token.to_vec(),
                SecurityBufferType::Token,
            )];
            let mut builder =
                EmptyInitializeSecurityContext::<<Ntlm as SspiImpl>::CredentialsHandle>::new()
                    .with_credentials_handle(&mut self.creds)
                    .with_context_requirements(
                        ClientRequestFlags::CONFIDENTIALITY | ClientRequestFlags::ALLOCATE_MEMORY,
                    )
                    .with_target_data_representation(DataRepresentation::Native)
                    .with_target_name(&self.target)
                    .with_input(&mut input_token)
                    .with_output(&mut output);
            self.ntlm.initialize_security_context_impl(&mut builder)?
        } else {
            let mut builder =
                EmptyInitializeSecurityContext::<<Ntlm as SspiImpl>::CredentialsHandle>::new()
                    .with_credentials_handle(&mut self.creds)
                    .with_context_requirements(
                        ClientRequestFlags::CONFIDENTIALITY | ClientRequestFlags::ALLOCATE_MEMORY,
                    )
                    .with_target_data_representation(DataRepresentation::Native)
                    .with_target_name(&self.target)
                    .with_output(&mut output);
            self.ntlm.initialize_security_context_impl(&mut builder)?
        };
        if matches!(
            result.status,
            SecurityStatus::CompleteNeeded | SecurityStatus::CompleteAndContinue
        ) {
            self.ntlm.complete_auth_token(&mut output)?;
        }
        Ok(output.remove(0).buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> AuthIdentity {
        AuthIdentity {
            username: "user".to_string(),
            password: "password".to_string().into(),
            domain: Some("CORP".to_string()),
        }
    }

    #[test]
    fn negotiate_produces_ntlmssp_token() {
        let mut session = NtlmSession::new(&test_identity(), "proxy.corp:3128").unwrap();
        let token = session.negotiate().unwrap();
        assert!(token.starts_with(b"NTLMSSP\0"));
        assert!(token.len() <= MAX_TOKEN_LEN);
    }

    #[test]
    fn header_round_trip() {
        let header = encode_auth_header(b"NTLMSSP\0rest").unwrap();
        let text = header.to_str().unwrap();
        assert!(text.starts_with("NTLM "));

        let decoded = decode_challenge(text).unwrap();
        assert_eq!(decoded, b"NTLMSSP\0rest");
    }

    #[test]
    fn challenge_requires_scheme_prefix() {
        assert!(decode_challenge("Negotiate abcd").is_err());
        assert!(decode_challenge("TlRMTVNTUAACAAAA").is_err());
    }

    #[test]
    fn pool_buffers_are_token_sized() {
        let buf = token_buf();
        assert!(buf.len() >= MAX_TOKEN_LEN);
        drop(buf);
        let again = token_buf();
        assert!(again.len() >= MAX_TOKEN_LEN);
    }
}
