use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::WIRE_VERSION;
use crate::error::ConduitError;

/// Signatures are accepted within this window around the verifier's clock.
const MAX_CLOCK_SKEW_SECS: i64 = 30 * 60;

/// The authentication fields embedded in every request and response.
///
/// The signed quantity is `token ‖ requestTime` only, never the payload.
/// That is a wire-compatibility contract: replay protection comes from the
/// random token plus the bounded clock-skew window, not from content binding.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    pub version: String,
    pub key_name: String,
    pub token: String,
    pub request_time: String,
    pub signature: String,
}

impl Envelope {
    /// Fill every envelope field and compute the signature with `secret`.
    pub fn sign(&mut self, key_name: &str, secret: &str) {
        self.version = WIRE_VERSION.to_string();
        self.key_name = key_name.to_string();
        self.token = conduit_crypt::signature::new_identifier();
        self.request_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.signature =
            conduit_crypt::signature::request_signature(secret, &self.token, &self.request_time);
    }

    /// Check the signature and the request-time window against `secret`.
    pub fn validate(&self, secret: &str) -> Result<(), ConduitError> {
        let Ok(request_time) = DateTime::parse_from_rfc3339(&self.request_time) else {
            return Err(ConduitError::SignatureInvalid);
        };
        let skew = Utc::now()
            .signed_duration_since(request_time.with_timezone(&Utc))
            .num_seconds();
        if skew.abs() > MAX_CLOCK_SKEW_SECS {
            return Err(ConduitError::SignatureInvalid);
        }
        if !conduit_crypt::signature::verify_signature(
            secret,
            &self.token,
            &self.request_time,
            &self.signature,
        ) {
            return Err(ConduitError::SignatureInvalid);
        }
        Ok(())
    }
}

/// Anything that carries an [`Envelope`]: every wire message in the protocol.
pub trait Signed {
    fn envelope(&self) -> &Envelope;
    fn envelope_mut(&mut self) -> &mut Envelope;

    fn sign(&mut self, key_name: &str, secret: &str) {
        self.envelope_mut().sign(key_name, secret);
    }

    fn validate(&self, secret: &str) -> Result<(), ConduitError> {
        self.envelope().validate(secret)
    }

    fn key_name(&self) -> &str {
        &self.envelope().key_name
    }
}
