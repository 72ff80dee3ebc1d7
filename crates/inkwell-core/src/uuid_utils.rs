//! UUID v7 utilities for time-ordered identifiers.
//!
//! Pages, knowledge units, tags, and jobs all use UUIDv7 keys so that primary
//! key order follows creation order.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use inkwell_core::uuid_utils::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
