//! The subspace identifier.
//!
//! A subspace id is `0x` followed by exactly 64 hexadecimal digits (66
//! characters total). Hex digits are accepted in either case. The id is kept
//! exactly as received: `0xAB..` and `0xab..` address different documents.

use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// Length of a subspace id including the `0x` prefix.
pub const SUBSPACE_ID_LEN: usize = 66;

/// Return whether `id` is a well-formed subspace id.
///
/// Pure check, no I/O: true iff the length is 66, the prefix is `0x`, and
/// the remaining 64 characters are all hex digits.
pub fn is_valid_subspace_id(id: &str) -> bool {
    id.len() == SUBSPACE_ID_LEN
        && id
            .strip_prefix("0x")
            .is_some_and(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// A validated subspace id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubspaceId(String);

impl SubspaceId {
    /// Validate and wrap `id`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidSubspaceId`] if `id` is malformed.
    pub fn parse(id: &str) -> Result<Self, FormatError> {
        if is_valid_subspace_id(id) {
            Ok(Self(id.to_owned()))
        } else {
            Err(FormatError::InvalidSubspaceId(id.to_owned()))
        }
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubspaceId {
    type Error = FormatError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        if is_valid_subspace_id(&id) {
            Ok(Self(id))
        } else {
            Err(FormatError::InvalidSubspaceId(id))
        }
    }
}

impl From<SubspaceId> for String {
    fn from(id: SubspaceId) -> Self {
        id.0
    }
}

impl AsRef<str> for SubspaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SubspaceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
