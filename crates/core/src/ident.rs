//! Payload-name filtering.
//!
//! Every artifact the dCache plugin drops into the staging tree is named by an
//! opaque hexadecimal file identifier. Anything else found in the staging
//! subdirectories (editor droppings, probe files, `.err` markers) is not
//! payload and must be ignored by every scan.

use std::path::Path;

/// Returns `true` when `name` is a valid payload identifier.
///
/// Identifiers are non-empty strings of ASCII hex digits, upper or lower
/// case. No other names are ever treated as payload.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Extracts the identifier from a path's final component, if it is one.
#[must_use]
pub fn identifier_of(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    is_identifier(name).then_some(name)
}
