//! Request identity derivation
//!
//! The identity is the partition key for caching and cleanup. It must
//! include every descriptor field that shapes the upstream request, so
//! that two semantically different requests can never share cached rows.
//! The principal is deliberately excluded: identical queries issued by
//! different principals read and write the same cache partition.

use std::fmt;

use crate::token::{RequestDescriptor, DATE_FORMAT};

/// Deterministic cache key for one logical request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity(String);

impl RequestIdentity {
    /// Derives the identity from a descriptor's request-affecting fields
    pub fn derive(descriptor: &RequestDescriptor) -> Self {
        Self(format!(
            "{}|{}|{}",
            descriptor.series_name,
            descriptor.start.format(DATE_FORMAT),
            descriptor.end.format(DATE_FORMAT),
        ))
    }

    /// The identity as stored in the `request_identity` column
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
