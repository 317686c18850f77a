//! Storage traits for organizations.

mod membership;

pub use membership::MembershipStore;
