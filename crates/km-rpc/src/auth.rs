//! Bearer-token authorization for outbound calls.
//!
//! The owning service authenticates its own clients; this only checks that
//! the credential handed to `call_authorized` is one of the configured
//! tokens and, optionally, that the token may reach the destination.

use std::collections::HashSet;

use crate::domain::correlation::PeerId;
use crate::ports::outbound::{AuthError, CallAuthorizer};

/// A configured token and the peers it may call (`None` means any).
struct Grant {
    token: String,
    peers: Option<HashSet<PeerId>>,
}

/// Accepts `Bearer <token>` or a bare token.
#[derive(Default)]
pub struct BearerTokenAuthorizer {
    grants: Vec<Grant>,
}

impl BearerTokenAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `token` to call every peer.
    #[must_use]
    pub fn allow(mut self, token: impl Into<String>) -> Self {
        self.grants.push(Grant {
            token: token.into(),
            peers: None,
        });
        self
    }

    /// Allow `token` to call only `peers`.
    #[must_use]
    pub fn allow_for<I, P>(mut self, token: impl Into<String>, peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        self.grants.push(Grant {
            token: token.into(),
            peers: Some(peers.into_iter().map(Into::into).collect()),
        });
        self
    }
}

impl CallAuthorizer for BearerTokenAuthorizer {
    fn authorize(&self, credential: &str, destination: &PeerId) -> Result<(), AuthError> {
        let token = credential
            .strip_prefix("Bearer ")
            .unwrap_or(credential)
            .trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        // Compare against every grant so timing does not reveal which one matched
        let mut matched: Option<&Grant> = None;
        for grant in &self.grants {
            if constant_time_compare(token, &grant.token) && matched.is_none() {
                matched = Some(grant);
            }
        }

        match matched {
            None => Err(AuthError::Invalid),
            Some(Grant {
                peers: Some(peers), ..
            }) if !peers.contains(destination) => Err(AuthError::Forbidden(destination.clone())),
            Some(_) => Ok(()),
        }
    }
}

/// Constant-time string comparison.
///
/// Both inputs are padded to the longer length so the loop length does not
/// depend on where they differ; the length check itself is also constant
/// time.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;

    let max_len = a.len().max(b.len());
    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0u8; max_len];
    a_padded[..a.len()].copy_from_slice(a.as_bytes());
    b_padded[..b.len()].copy_from_slice(b.as_bytes());

    let lengths_equal = (a.len() as u64).ct_eq(&(b.len() as u64));
    let contents_equal = a_padded.ct_eq(&b_padded);
    (lengths_equal & contents_equal).into()
}
