//! AN file version checks.

use crate::error::{AotError, AotResult};

/// Version of the AN files this service produces.
pub const AOT_VERSION: &str = "4.0.0.5";

const VERSION_PARTS: usize = 4;

/// Parse a dotted `a.b.c.d` version.
pub fn parse_version(text: &str) -> Option<[u8; VERSION_PARTS]> {
    let mut parts = [0u8; VERSION_PARTS];
    let mut count = 0;
    for piece in text.split('.') {
        if count == VERSION_PARTS {
            return None;
        }
        parts[count] = piece.parse().ok()?;
        count += 1;
    }
    (count == VERSION_PARTS).then_some(parts)
}

/// Whether artifacts built at `old_version` must be rebuilt.
pub fn need_re_compile(old_version: &str) -> AotResult<bool> {
    let old = parse_version(old_version)
        .ok_or_else(|| AotError::param(format!("malformed aot version {old_version:?}")))?;
    let current = parse_version(AOT_VERSION)
        .ok_or_else(|| AotError::param(format!("malformed service version {AOT_VERSION:?}")))?;
    Ok(old != current)
}
