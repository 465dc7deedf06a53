//! Well-formedness rules for share addresses, author addresses and paths.
//!
//! These are pure predicates: no I/O, no state. Each check either succeeds
//! or returns a [`ValidationError`] naming the rule that failed.

use crate::error::ValidationError;

/// Alphabet of base32 strings (RFC 4648 lowercase, no padding).
pub const ALPHA_BASE32: &str = "abcdefghijklmnopqrstuvwxyz234567";

/// Punctuation allowed in paths, beyond ASCII alphanumerics.
pub const PATH_PUNCTUATION: &str = "/'()-._~!*$&+,:=@%";

/// Length of a base32-encoded ed25519 public key, without the `b` marker.
const PUBKEY_B32_LEN: usize = 52;

/// Author shortnames are exactly this long.
const SHORTNAME_LEN: usize = 4;

/// Share names are between 1 and this many characters.
const SHARE_NAME_MAX_LEN: usize = 15;

/// Paths are between 2 and this many characters.
const PATH_MAX_LEN: usize = 512;

/// An address split into its name and base32 public key suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    /// The shortname (authors) or share name.
    pub name: String,
    /// The `b`-prefixed base32 public key.
    pub pubkey: String,
}

fn is_base32_char(c: char) -> bool {
    ALPHA_BASE32.contains(c)
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_lowercase()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || PATH_PUNCTUATION.contains(c)
}

fn check_pubkey_suffix(pubkey: &str, what: &str) -> Result<(), ValidationError> {
    let Some(b32) = pubkey.strip_prefix('b') else {
        return Err(ValidationError::new(format!(
            "{what} public key must start with 'b'"
        )));
    };
    if b32.len() != PUBKEY_B32_LEN {
        return Err(ValidationError::new(format!(
            "{what} public key must be {} base32 characters, got {}",
            PUBKEY_B32_LEN,
            b32.len()
        )));
    }
    if !b32.chars().all(is_base32_char) {
        return Err(ValidationError::new(format!(
            "{what} public key contains non-base32 characters"
        )));
    }
    Ok(())
}

fn parse_address<'a>(
    addr: &'a str,
    sigil: char,
    what: &str,
) -> Result<(&'a str, &'a str), ValidationError> {
    let Some(rest) = addr.strip_prefix(sigil) else {
        return Err(ValidationError::new(format!(
            "{what} address must start with '{sigil}'"
        )));
    };
    let mut parts = rest.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(pubkey), None) => Ok((name, pubkey)),
        _ => Err(ValidationError::new(format!(
            "{what} address must have exactly two parts separated by '.'"
        ))),
    }
}

/// Split an author address into shortname and public key, checking shape.
pub fn parse_author_address(addr: &str) -> Result<ParsedAddress, ValidationError> {
    let (name, pubkey) = parse_address(addr, '@', "author")?;
    if name.len() != SHORTNAME_LEN {
        return Err(ValidationError::new(format!(
            "author shortname must be {SHORTNAME_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(is_name_start) {
        return Err(ValidationError::new(
            "author shortname must start with a lowercase letter",
        ));
    }
    if !chars.all(is_name_char) {
        return Err(ValidationError::new(
            "author shortname may only contain lowercase letters and digits",
        ));
    }
    check_pubkey_suffix(pubkey, "author")?;
    Ok(ParsedAddress {
        name: name.to_string(),
        pubkey: pubkey.to_string(),
    })
}

/// Split a share address into name and public key, checking shape.
pub fn parse_share_address(addr: &str) -> Result<ParsedAddress, ValidationError> {
    let (name, pubkey) = parse_address(addr, '+', "share")?;
    if name.is_empty() || name.len() > SHARE_NAME_MAX_LEN {
        return Err(ValidationError::new(format!(
            "share name must be 1 to {SHARE_NAME_MAX_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(is_name_start) {
        return Err(ValidationError::new(
            "share name must start with a lowercase letter",
        ));
    }
    if !chars.all(is_name_char) {
        return Err(ValidationError::new(
            "share name may only contain lowercase letters and digits",
        ));
    }
    check_pubkey_suffix(pubkey, "share")?;
    Ok(ParsedAddress {
        name: name.to_string(),
        pubkey: pubkey.to_string(),
    })
}

/// Check that `addr` is a well-formed author address.
pub fn check_author_is_valid(addr: &str) -> Result<(), ValidationError> {
    parse_author_address(addr).map(|_| ())
}

/// Check that `addr` is a well-formed share address.
pub fn check_share_is_valid(addr: &str) -> Result<(), ValidationError> {
    parse_share_address(addr).map(|_| ())
}

/// Returns true if `path` marks its documents as ephemeral.
pub fn path_is_ephemeral(path: &str) -> bool {
    path.contains('!')
}

/// Check the shape of a document path.
///
/// `has_delete_after` couples the `!` marker to the ephemerality of the
/// document: ephemeral paths must carry a `deleteAfter`, permanent paths
/// must not.
pub fn check_path_is_valid(path: &str, has_delete_after: bool) -> Result<(), ValidationError> {
    if path.len() < 2 || path.len() > PATH_MAX_LEN {
        return Err(ValidationError::new(format!(
            "path must be 2 to {PATH_MAX_LEN} characters, got {}",
            path.len()
        )));
    }
    if !path.starts_with('/') {
        return Err(ValidationError::new("path must start with '/'"));
    }
    if path.ends_with('/') {
        return Err(ValidationError::new("path must not end with '/'"));
    }
    if path.starts_with("/@") {
        return Err(ValidationError::new("path must not start with '/@'"));
    }
    if path.contains("//") {
        return Err(ValidationError::new("path must not contain '//'"));
    }
    if let Some(c) = path.chars().find(|c| !is_path_char(*c)) {
        return Err(ValidationError::new(format!(
            "path contains disallowed character {c:?}"
        )));
    }
    match (path_is_ephemeral(path), has_delete_after) {
        (true, false) => Err(ValidationError::new(
            "path contains '!' but document has no deleteAfter",
        )),
        (false, true) => Err(ValidationError::new(
            "document has deleteAfter but path contains no '!'",
        )),
        _ => Ok(()),
    }
}

/// Check the path-scoping rule: a path containing `~` is only writable by
/// authors whose address appears after a `~` in the path.
pub fn check_author_can_write_to_path(author: &str, path: &str) -> Result<(), ValidationError> {
    if path.contains('~') && !path.contains(&format!("~{author}")) {
        return Err(ValidationError::new(format!(
            "author {author} cannot write to owned path {path}"
        )));
    }
    Ok(())
}
