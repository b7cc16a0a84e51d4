//! Proof-of-work backends.
//!
//! Hash functions live outside the pool. A backend registers itself at link
//! time with `inventory::submit!` and chain adapters look it up by chain:
//!
//! ```ignore
//! inventory::submit! {
//!     PowDescriptor {
//!         chain: "ETC",
//!         name: "etchash",
//!         create_fn: || Ok(Box::new(Etchash::new())),
//!     }
//! }
//! ```

use crate::error::{Error, Result};
use crate::node::Hash;

/// What a backend hashes.
#[derive(Debug, Clone, Copy)]
pub struct PowInput<'a> {
    pub header: &'a [u8],
    pub nonce: &'a [u8],
    /// Some algorithms (Ethash, Autolykos) depend on the epoch.
    pub height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowOutput {
    pub hash: Hash,
    /// Ethash-family mix digest; zero for other algorithms.
    pub mix_digest: Hash,
}

/// A proof-of-work function.
pub trait PowVerifier: Send + Sync {
    fn compute(&self, input: &PowInput<'_>) -> Result<PowOutput>;
}

/// Link-time registration of a backend.
pub struct PowDescriptor {
    /// Chain ticker the backend serves.
    pub chain: &'static str,
    pub name: &'static str,
    pub create_fn: fn() -> Result<Box<dyn PowVerifier>>,
}

inventory::collect!(PowDescriptor);

/// Finds registered backends.
pub struct PowRegistry;

impl PowRegistry {
    pub fn find(chain: &str) -> Option<&'static PowDescriptor> {
        inventory::iter::<PowDescriptor>().find(|desc| desc.chain.eq_ignore_ascii_case(chain))
    }

    /// Instantiate the backend for `chain`.
    pub fn create(chain: &str) -> Result<Box<dyn PowVerifier>> {
        let desc = Self::find(chain)
            .ok_or_else(|| Error::Pow(format!("no proof-of-work backend linked for {chain}")))?;
        (desc.create_fn)()
    }

    pub fn chains() -> Vec<&'static str> {
        inventory::iter::<PowDescriptor>().map(|desc| desc.chain).collect()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Hash is the nonce right-aligned in 32 bytes; mix digest is the header.
    pub struct EchoPow;

    impl PowVerifier for EchoPow {
        fn compute(&self, input: &PowInput<'_>) -> Result<PowOutput> {
            if input.nonce.len() > 32 || input.header.len() > 32 {
                return Err(Error::Pow("input too long".into()));
            }
            let mut hash = [0u8; 32];
            hash[32 - input.nonce.len()..].copy_from_slice(input.nonce);
            let mut mix_digest = [0u8; 32];
            mix_digest[32 - input.header.len()..].copy_from_slice(input.header);
            Ok(PowOutput { hash, mix_digest })
        }
    }

    inventory::submit! {
        PowDescriptor {
            chain: "TEST",
            name: "echo",
            create_fn: || Ok(Box::new(EchoPow)),
        }
    }
}
