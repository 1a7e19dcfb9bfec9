//! Signed request token verification
//!
//! Client requests arrive as HS256-signed JWTs whose payload describes the
//! data being asked for. Verification is a pure function of the token and
//! the configured secret: it checks the signature and expiry, then extracts
//! a trusted `RequestDescriptor`. Nothing here touches the network or the
//! store.

use chrono::NaiveDate;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Date format expected in token payloads and sent upstream
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Errors that can occur while verifying a request token
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The token is not a parseable signed envelope
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The signature does not match the configured secret
    #[error("Token signature is invalid")]
    SignatureInvalid,

    /// The token's expiry claim is in the past
    #[error("Token has expired")]
    Expired,

    /// A required descriptor field is absent or blank
    #[error("Missing required field in token: {0}")]
    MissingField(&'static str),

    /// A date field does not match the expected format
    #[error("Invalid date in field {field}: '{value}'")]
    InvalidDate { field: &'static str, value: String },

    /// The start bound is after the end bound
    #[error("Invalid date range: {start} is after {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
}

/// JWT payload carried by a request token
///
/// All descriptor fields are optional at the serde level so that an absent
/// field surfaces as `MissingField` rather than a generic parse failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Upstream series/resource identifier
    pub series_name: Option<String>,
    /// Inclusive start of the requested date range
    pub start_date: Option<String>,
    /// Inclusive end of the requested date range
    pub end_date: Option<String>,
    /// Issuing principal (username)
    pub sub: Option<String>,
    /// Issued-at (seconds since epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
    /// Expiry (seconds since epoch)
    pub exp: usize,
}

/// Trusted, decoded request fields
///
/// Immutable once produced by verification; everything downstream (identity
/// derivation, the upstream request) works from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Series/resource identifier interpolated into the upstream URL
    pub series_name: String,
    /// Inclusive start of the requested range
    pub start: NaiveDate,
    /// Inclusive end of the requested range
    pub end: NaiveDate,
    /// Principal the token was issued to
    pub principal: String,
}

/// Verifies request tokens against a configured secret
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Creates a verifier for HS256 tokens signed with `secret`
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verifies a token and extracts its request descriptor
    ///
    /// # Returns
    /// * `Ok(RequestDescriptor)` for a well-signed token with all fields
    /// * `Err(VerifyError)` classifying exactly what was wrong
    pub fn verify(&self, token: &str) -> Result<RequestDescriptor, VerifyError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Malformed(e.to_string()),
            }
        })?;

        descriptor_from_claims(data.claims)
    }
}

/// Builds a trusted descriptor out of decoded claims, rejecting blanks
fn descriptor_from_claims(claims: Claims) -> Result<RequestDescriptor, VerifyError> {
    let series_name = require(claims.series_name, "series_name")?;
    let start_str = require(claims.start_date, "start_date")?;
    let end_str = require(claims.end_date, "end_date")?;
    let principal = require(claims.sub, "sub")?;

    let start = parse_date(&start_str, "start_date")?;
    let end = parse_date(&end_str, "end_date")?;
    if start > end {
        return Err(VerifyError::InvalidDateRange { start, end });
    }

    Ok(RequestDescriptor {
        series_name,
        start,
        end,
        principal,
    })
}

fn require(value: Option<String>, field: &'static str) -> Result<String, VerifyError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(VerifyError::MissingField(field)),
    }
}

fn parse_date(value: &str, field: &'static str) -> Result<NaiveDate, VerifyError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| VerifyError::InvalidDate {
        field,
        value: value.to_string(),
    })
}

/// Signs a set of claims into a token
///
/// Issuance lives with whoever hands tokens to clients; this helper exists
/// for that tooling and for tests that need a well-signed input.
pub fn mint_token(claims: &Claims, secret: &str) -> Result<String, VerifyError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| VerifyError::Malformed(e.to_string()))
}
