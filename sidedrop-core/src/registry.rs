use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::signaling::SessionDescription;

/// Crockford base32 alphabet (no I, L, O, U), so codes survive being
/// read aloud or hand-copied.
const CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
/// Symbols per group and groups per code. 25 symbols at 5 bits each is
/// 125 bits of entropy, comfortably past the point where collisions or
/// guessing matter.
const CODE_GROUP_LEN: usize = 5;
const CODE_GROUPS: usize = 5;
/// Collision retries before declaring the space exhausted. With 125-bit
/// codes a single retry is already unreachable in practice.
const MAX_CODE_ATTEMPTS: usize = 8;

/// How long a stored offer stays claimable before it expires.
pub const DEFAULT_OFFER_TTL: Duration = Duration::from_secs(15 * 60);

/// Errors from storing or claiming offers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The code does not map to a live offer — never stored, already
    /// claimed, or expired.
    #[error("unknown or expired code: {code}")]
    UnknownCode { code: String },

    /// Code generation kept colliding with stored entries.
    #[error("offer code space exhausted")]
    CodeSpaceExhausted,
}

struct StoredOffer {
    description: SessionDescription,
    stored_at: Instant,
}

/// Maps short human-shareable codes to pending offers.
///
/// This is the only state in sidedrop shared across independent sessions,
/// so it serializes all access behind a mutex. Entries are single-use —
/// a successful [`lookup`](OfferRegistry::lookup) removes the entry — and
/// additionally expire after a TTL, so the map stays bounded even when no
/// receiver ever claims a code.
pub struct OfferRegistry {
    entries: Mutex<HashMap<String, StoredOffer>>,
    ttl: Duration,
}

impl Default for OfferRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OFFER_TTL)
    }
}

impl OfferRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Stores an offer and returns the fresh code that claims it.
    ///
    /// Expired entries are purged on every store, so the registry never
    /// grows past the set of offers stored within one TTL window.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CodeSpaceExhausted`] if code generation
    /// keeps colliding — practically unreachable with 125-bit codes.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex was poisoned by a panicking thread.
    pub fn store(&self, description: SessionDescription) -> Result<String, RegistryError> {
        let mut entries = self.entries.lock().expect("offer registry lock poisoned");

        entries.retain(|_, offer| offer.stored_at.elapsed() < self.ttl);

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code();
            if entries.contains_key(&code) {
                continue;
            }
            debug!(code = %code, "Offer stored");
            entries.insert(
                code.clone(),
                StoredOffer {
                    description,
                    stored_at: Instant::now(),
                },
            );
            return Ok(code);
        }

        Err(RegistryError::CodeSpaceExhausted)
    }

    /// Claims the offer stored under `code`, removing it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownCode`] if the code was never
    /// stored, was already claimed, or has expired.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex was poisoned by a panicking thread.
    pub fn lookup(&self, code: &str) -> Result<SessionDescription, RegistryError> {
        let mut entries = self.entries.lock().expect("offer registry lock poisoned");

        match entries.remove(code) {
            Some(offer) if offer.stored_at.elapsed() < self.ttl => Ok(offer.description),
            _ => Err(RegistryError::UnknownCode {
                code: code.to_string(),
            }),
        }
    }

    /// Number of live (unclaimed, unexpired) entries.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex was poisoned by a panicking thread.
    #[must_use]
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("offer registry lock poisoned");
        entries
            .values()
            .filter(|offer| offer.stored_at.elapsed() < self.ttl)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Generates a fresh registry code: `XXXXX-XXXXX-XXXXX-XXXXX-XXXXX` over
/// the unambiguous alphabet.
#[must_use]
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(CODE_GROUPS * (CODE_GROUP_LEN + 1) - 1);
    for group in 0..CODE_GROUPS {
        if group > 0 {
            code.push('-');
        }
        for _ in 0..CODE_GROUP_LEN {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            code.push(CODE_ALPHABET[idx] as char);
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{DescriptionKind, SessionDescription};

    fn sample_offer() -> SessionDescription {
        SessionDescription::offer("mem", "mem:0".into(), None)
    }

    /// Given N stored offers, when the codes are compared, then all N codes are distinct.
    #[test]
    fn given_many_stores_when_codes_compared_then_all_distinct() {
        let registry = OfferRegistry::default();
        let mut codes = std::collections::HashSet::new();
        for _ in 0..64 {
            let code = registry.store(sample_offer()).unwrap();
            assert!(codes.insert(code), "registry produced a duplicate code");
        }
        assert_eq!(registry.len(), 64);
    }

    /// Given a stored offer, when looked up by its code, then the original description is returned.
    #[test]
    fn given_stored_offer_when_looked_up_then_returns_description() {
        let registry = OfferRegistry::default();
        let offer = sample_offer();
        let code = registry.store(offer.clone()).unwrap();
        let found = registry.lookup(&code).unwrap();
        assert_eq!(found, offer);
        assert_eq!(found.kind, DescriptionKind::Offer);
    }

    /// Given a code that was never stored, when looked up, then UnknownCode is returned.
    #[test]
    fn given_unknown_code_when_looked_up_then_returns_unknown_code() {
        let registry = OfferRegistry::default();
        let err = registry.lookup("ZZZZZ-ZZZZZ-ZZZZZ-ZZZZZ-ZZZZZ").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCode { .. }));
    }

    /// Given a claimed code, when looked up a second time, then UnknownCode is returned.
    #[test]
    fn given_claimed_code_when_looked_up_again_then_returns_unknown_code() {
        let registry = OfferRegistry::default();
        let code = registry.store(sample_offer()).unwrap();
        registry.lookup(&code).unwrap();
        let err = registry.lookup(&code).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCode { .. }));
    }

    /// Given a zero TTL, when a stored offer is looked up, then it has already expired.
    #[test]
    fn given_expired_entry_when_looked_up_then_returns_unknown_code() {
        let registry = OfferRegistry::new(Duration::ZERO);
        let code = registry.store(sample_offer()).unwrap();
        let err = registry.lookup(&code).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCode { .. }));
    }

    /// Given a zero TTL, when a new offer is stored, then earlier entries have been purged.
    #[test]
    fn given_expired_entries_when_storing_then_registry_stays_bounded() {
        let registry = OfferRegistry::new(Duration::ZERO);
        for _ in 0..16 {
            registry.store(sample_offer()).unwrap();
        }
        // Everything stored above expired instantly; only un-elapsed
        // entries would count, and with a zero TTL there are none.
        assert!(registry.is_empty());
    }

    /// Given a generated code, when inspected, then it has the expected shape and alphabet.
    #[test]
    fn given_generated_code_when_inspected_then_shape_and_alphabet_hold() {
        let code = generate_code();
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), CODE_GROUPS);
        for group in groups {
            assert_eq!(group.len(), CODE_GROUP_LEN);
            assert!(group.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    /// Given concurrent stores from several threads, when all finish, then every code is unique.
    #[test]
    fn given_concurrent_stores_when_finished_then_codes_unique() {
        let registry = std::sync::Arc::new(OfferRegistry::default());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                (0..32)
                    .map(|_| registry.store(sample_offer()).unwrap())
                    .collect::<Vec<_>>()
            }));
        }
        let mut all = std::collections::HashSet::new();
        for handle in handles {
            for code in handle.join().unwrap() {
                assert!(all.insert(code), "colliding code across threads");
            }
        }
        assert_eq!(registry.len(), 4 * 32);
    }
}
