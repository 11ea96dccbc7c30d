//! Short numeric identities for connected parties.

use std::collections::HashMap;

use rand::Rng;
use tracing::{debug, warn};

use crate::{ConnId, Identity, MAX_ALLOCATION_ATTEMPTS, MAX_IDENTITY_DIGITS, RelayError};

/// Maps each registered identity to the connection that owns it.
#[derive(Debug)]
pub struct IdentityRegistry {
    owners: HashMap<Identity, ConnId>,
    digits: usize,
    max_digits: usize,
}

impl IdentityRegistry {
    /// Creates a registry handing out `digits`-digit codes.
    pub fn new(digits: usize) -> Self {
        Self::with_limits(digits, MAX_IDENTITY_DIGITS.max(digits))
    }

    /// Creates a registry that may widen codes up to `max_digits`.
    pub fn with_limits(digits: usize, max_digits: usize) -> Self {
        let digits = digits.max(1);
        Self {
            owners: HashMap::new(),
            digits,
            max_digits: max_digits.max(digits),
        }
    }

    /// Generates a free code and registers it for `conn`.
    ///
    /// Collision check and registration happen in one step, so a code
    /// is never handed out twice.
    pub fn allocate(&mut self, conn: ConnId) -> Result<Identity, RelayError> {
        self.allocate_with(conn, &mut rand::thread_rng())
    }

    fn allocate_with<R: Rng>(&mut self, conn: ConnId, rng: &mut R) -> Result<Identity, RelayError> {
        for digits in self.digits..=self.max_digits {
            for _ in 0..MAX_ALLOCATION_ATTEMPTS {
                let candidate = Identity(random_code(rng, digits));
                if !self.owners.contains_key(&candidate) {
                    self.owners.insert(candidate.clone(), conn);
                    debug!(%conn, identity = %candidate, "identity allocated");
                    return Ok(candidate);
                }
            }
            warn!(digits, registered = self.owners.len(), "identity space congested, widening");
        }
        Err(RelayError::IdentitySpaceExhausted(self.max_digits))
    }

    /// Removes the mapping. Releasing an unknown identity is a no-op.
    pub fn release(&mut self, identity: &Identity) -> Option<ConnId> {
        self.owners.remove(identity)
    }

    /// Returns the connection currently owning `identity`.
    pub fn lookup(&self, identity: &str) -> Option<ConnId> {
        self.owners.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

fn random_code<R: Rng>(rng: &mut R, digits: usize) -> String {
    (0..digits)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
