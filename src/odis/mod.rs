//! Oblivious signing oracle.
//!
//! Two roles share this module:
//!
//! - **Signer** ([`SignerService`]): holds one key, enforces domain and
//!   account quotas against its own store, and returns partial signatures.
//! - **Combiner** ([`Combiner`]): validates public requests, fans them out
//!   to all signers, and aggregates a `t`-of-`n` quorum of verified partials.
//!
//! Wire types live in [`types`], endpoint translation in [`endpoints`], and
//! every quorum rule in [`quorum`].

pub mod combiner;
pub mod crypto;
pub mod endpoints;
pub mod quorum;
pub mod signer_logic;
pub mod transport;
pub mod types;

pub use combiner::Combiner;
pub use crypto::{Ed25519Keyring, Ed25519QuorumCombiner, PartialSigner, SignatureCombiner};
pub use endpoints::{CombinerEndpoint, KEY_VERSION_HEADER, SignerEndpoint};
pub use quorum::{QuorumDecision, SignerOutcome, ThresholdPolicy, threshold_domain_state};
pub use signer_logic::{SignerPolicy, SignerService};
pub use transport::{HttpSignerTransport, SignerReply, SignerTransport};
