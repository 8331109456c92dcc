//! Token-wise subject matching

use super::limits::{SINGLE_WILDCARD, TAIL_WILDCARD};

/// Returns true if a concrete `subject` is matched by `pattern`.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
/// Both arguments are expected to be validated already.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
	let mut pattern_tokens = pattern.split('.');
	let mut subject_tokens = subject.split('.');

	loop {
		match (pattern_tokens.next(), subject_tokens.next()) {
			| (Some(TAIL_WILDCARD), Some(_)) => return true,
			| (Some(SINGLE_WILDCARD), Some(_)) => {}
			| (Some(p), Some(s)) if p == s => {}
			| (None, None) => return true,
			| _ => return false,
		}
	}
}
