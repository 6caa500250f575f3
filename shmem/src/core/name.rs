use crate::errors::{QueueError, Result};

/// Prefix of the shared-memory object holding the ring buffer.
pub const MAPPING_PREFIX: &str = "mmf_";
/// Prefix of the shared-memory object holding the buffer's lock.
pub const LOCK_PREFIX: &str = "mm_queue_";

#[inline]
fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Turns a caller supplied buffer name into a name that is safe to use as an OS
/// shared object name. Every character outside `[A-Za-z0-9_.-]` becomes `_`.
pub fn normalize(raw: &str, prefix: &str) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(QueueError::InvalidName(raw.to_string()));
    }
    let mut out = String::with_capacity(prefix.len() + raw.len());
    out.push_str(prefix);
    out.extend(raw.chars().map(|c| if is_allowed(c) { c } else { '_' }));
    Ok(out)
}

/// POSIX shared memory names start with a single slash.
#[inline]
pub fn os_id(normalized: &str) -> String {
    format!("/{}", normalized)
}
