//! Request identifiers.
//!
//! A request id is the file name of the requester's endpoint in the socket
//! directory. Only names made of `A-Z` and `0-9` are accepted; anything
//! else in the directory is not a request.

use rand::RngCore;

use crate::constants::REQUEST_ID_LEN;

/// Validated request id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

/// Error for names that are not valid request ids.
#[derive(Debug, thiserror::Error)]
#[error("invalid request id {0:?}: expected [A-Z0-9]+")]
pub struct InvalidRequestId(pub String);

impl RequestId {
    /// Validate `raw` against `[A-Z0-9]+`.
    pub fn parse(raw: &str) -> Result<Self, InvalidRequestId> {
        let valid = !raw.is_empty()
            && raw
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidRequestId(raw.to_string()))
        }
    }

    /// Fresh random id: 32 uppercase hex characters (128 bits).
    pub fn generate() -> Self {
        let mut bytes = [0u8; REQUEST_ID_LEN / 2];
        rand::rng().fill_bytes(&mut bytes);
        Self(data_encoding::HEXUPPER.encode(&bytes))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = InvalidRequestId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A request read from its endpoint.
#[derive(Clone, Debug)]
pub struct Request {
    /// Endpoint name.
    pub id: RequestId,
    /// Opaque request bytes as written by the requester.
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_uppercase_alnum() {
        assert_eq!(RequestId::parse("ABC123").unwrap().as_str(), "ABC123");
        assert!("0F9E".parse::<RequestId>().is_ok());
    }

    #[test]
    fn test_parse_rejects_others() {
        for bad in ["", "abc", "AB-12", "AB 12", ".hidden", "ÄBC", "../X"] {
            assert!(RequestId::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_generate_shape() {
        let id = RequestId::generate();
        assert_eq!(id.as_str().len(), REQUEST_ID_LEN);
        assert!(RequestId::parse(id.as_str()).is_ok());
        assert_ne!(id, RequestId::generate());
    }
}
