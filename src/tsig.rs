/* src/tsig.rs */

//! Shared-secret transaction signatures (RFC 8945) for both transports.
//!
//! Requests are checked with hickory's verifier. Responses are signed here
//! so the MAC can cover exactly the bytes that go on the wire, compressed or
//! not, and so consecutive transfer envelopes can chain their MACs.

use crate::error::TsigError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hickory_proto::dnssec::rdata::tsig::{TSIG, TsigAlgorithm, make_tsig_record};
use hickory_proto::dnssec::tsig::TSigner;
use hickory_proto::rr::Name;
use hickory_proto::serialize::binary::BinEncodable;
use std::str::FromStr;

/// Allowed clock skew between signer and verifier, in seconds.
pub const FUDGE: u16 = 300;

const ANY_CLASS: u16 = 255;

/// A `name:base64secret` pair from the configuration.
#[derive(Debug, Clone)]
pub struct TsigKey {
    name: Name,
    secret: Vec<u8>,
}

impl TsigKey {
    pub fn parse(value: &str) -> Result<Self, TsigError> {
        let (name, secret) = value.split_once(':').ok_or(TsigError::BadFormat)?;
        if name.is_empty() || secret.is_empty() {
            return Err(TsigError::BadFormat);
        }
        let fqdn = if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{}.", name)
        };
        let name = Name::from_str(&fqdn).map_err(|e| TsigError::BadName(e.to_string()))?;
        let secret = BASE64.decode(secret.trim())?;
        Ok(Self { name, secret })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }
}

/// Verifies inbound requests and signs outbound responses with one key.
pub struct Authenticator {
    signer: TSigner,
}

impl Authenticator {
    pub fn new(key: &TsigKey) -> Result<Self, TsigError> {
        let signer = TSigner::new(
            key.secret.clone(),
            TsigAlgorithm::HmacSha256,
            key.name.clone(),
            FUDGE,
        )
        .map_err(|e| TsigError::Sign(e.to_string()))?;
        Ok(Self { signer })
    }

    pub fn key_name(&self) -> &Name {
        self.signer.signer_name()
    }

    #[cfg(test)]
    pub(crate) fn signer(&self) -> &TSigner {
        &self.signer
    }

    /// Checks the request's TSIG and returns its MAC, which the first
    /// response message must cover. Unsigned requests are rejected.
    pub fn verify_request(&self, wire: &[u8], now: u64) -> Result<Vec<u8>, TsigError> {
        let (mac, window, _) = self
            .signer
            .verify_message_byte(None, wire, true)
            .map_err(|e| TsigError::Verify(e.to_string()))?;
        if !window.contains(&now) {
            return Err(TsigError::Verify(format!(
                "signature time outside {}..{} (now {})",
                window.start, window.end, now
            )));
        }
        Ok(mac)
    }

    /// Appends a TSIG record to an encoded response and returns the signed
    /// message along with its MAC.
    ///
    /// `previous_mac` is the request MAC for the first message of a reply
    /// and the previous message's MAC for every later transfer envelope.
    /// Later envelopes sign only time and fudge, per RFC 8945 section 5.3.1.
    pub fn sign_response(
        &self,
        mut wire: Vec<u8>,
        previous_mac: &[u8],
        first_message: bool,
        now: u64,
    ) -> Result<(Vec<u8>, Vec<u8>), TsigError> {
        if wire.len() < 12 {
            return Err(TsigError::Sign("message shorter than a header".to_string()));
        }
        let message_id = u16::from_be_bytes([wire[0], wire[1]]);

        let mut tbs = Vec::with_capacity(previous_mac.len() + wire.len() + 64);
        tbs.extend_from_slice(&(previous_mac.len() as u16).to_be_bytes());
        tbs.extend_from_slice(previous_mac);
        tbs.extend_from_slice(&wire);
        if first_message {
            self.emit_variables(&mut tbs, now)?;
        } else {
            emit_time(&mut tbs, now);
            tbs.extend_from_slice(&FUDGE.to_be_bytes());
        }

        let mac = self
            .signer
            .sign(&tbs)
            .map_err(|e| TsigError::Sign(e.to_string()))?;
        let tsig = TSIG::new(
            self.signer.algorithm().clone(),
            now,
            FUDGE,
            mac.clone(),
            message_id,
            0,
            Vec::new(),
        );
        let record = make_tsig_record(self.key_name().clone(), tsig)
            .to_bytes()
            .map_err(|e| TsigError::Sign(e.to_string()))?;

        let additional = u16::from_be_bytes([wire[10], wire[11]]) + 1;
        wire[10..12].copy_from_slice(&additional.to_be_bytes());
        wire.extend_from_slice(&record);
        Ok((wire, mac))
    }

    /// Full TSIG variables: key name, class, TTL, algorithm, time, fudge,
    /// error and an empty other-data field.
    fn emit_variables(&self, tbs: &mut Vec<u8>, now: u64) -> Result<(), TsigError> {
        let canonical = |name: &Name| {
            name.to_lowercase()
                .to_bytes()
                .map_err(|e| TsigError::Sign(e.to_string()))
        };
        tbs.extend_from_slice(&canonical(self.key_name())?);
        tbs.extend_from_slice(&ANY_CLASS.to_be_bytes());
        tbs.extend_from_slice(&0u32.to_be_bytes());
        tbs.extend_from_slice(&canonical(&self.signer.algorithm().to_name())?);
        emit_time(tbs, now);
        tbs.extend_from_slice(&FUDGE.to_be_bytes());
        tbs.extend_from_slice(&0u16.to_be_bytes());
        tbs.extend_from_slice(&0u16.to_be_bytes());
        Ok(())
    }
}

/// 48-bit seconds since the epoch.
fn emit_time(buf: &mut Vec<u8>, time: u64) {
    buf.extend_from_slice(&((time >> 32) as u16).to_be_bytes());
    buf.extend_from_slice(&(time as u32).to_be_bytes());
}
