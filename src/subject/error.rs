//! Error types and validation rules for subjects and queue groups

use thiserror::Error;

/// Errors raised when a subject or queue-group name is malformed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubjectError {
	/// Subject is empty or blank
	#[error("Subject is required")]
	EmptySubject,

	/// Queue-group name is empty or blank
	#[error("Queue group name is required")]
	EmptyQueueGroup,

	/// Whitespace is never allowed in subjects or queue groups
	#[error("'{value}' cannot contain whitespace")]
	Whitespace {
		/// Offending subject or queue-group name
		value: String,
	},

	/// A token between two dots is empty (`a..b`, `.a`, `a.`)
	#[error("Subject '{subject}' contains an empty token at position {index}")]
	EmptyToken {
		/// Offending subject
		subject: String,
		/// Zero-based token index
		index: usize,
	},

	/// Wildcard characters used inside a token or `>` not in last place
	#[error("Invalid wildcard usage in '{subject}': {usage}")]
	WildcardUsage {
		/// Offending subject
		subject: String,
		/// Description of the misuse
		usage: String,
	},

	/// Queue-group names cannot carry wildcards
	#[error("Queue group '{queue_group}' cannot contain wildcards")]
	WildcardQueueGroup {
		/// Offending queue-group name
		queue_group: String,
	},

	/// Value exceeds the length limit
	#[error("'{value}' is longer than {max} bytes")]
	TooLong {
		/// Offending value (truncated)
		value: String,
		/// Limit that was exceeded
		max: usize,
	},
}

impl SubjectError {
	/// Creates a new WildcardUsage error
	pub fn wildcard_usage(
		subject: impl Into<String>,
		usage: impl Into<String>,
	) -> Self {
		Self::WildcardUsage {
			subject: subject.into(),
			usage: usage.into(),
		}
	}

	fn whitespace(value: impl Into<String>) -> Self {
		Self::Whitespace {
			value: value.into(),
		}
	}

	fn too_long(value: &str, max: usize) -> Self {
		Self::TooLong {
			value: value.chars().take(32).collect(),
			max,
		}
	}
}

/// Convenient Result type for subject validation
pub type SubjectResult<T> = Result<T, SubjectError>;

/// Subject limits
pub mod limits {
	/// Maximum length of a subject or queue-group name in bytes
	pub const MAX_SUBJECT_LENGTH: usize = 4096;

	/// Single-token wildcard
	pub const SINGLE_WILDCARD: &str = "*";

	/// Tail wildcard, only valid as the last token
	pub const TAIL_WILDCARD: &str = ">";
}

/// Validation utilities for subjects and queue groups
pub mod validation {
	use super::limits::*;
	use super::SubjectError;

	/// Validates a subject used for subscribing; wildcards are allowed.
	pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
		if subject.trim().is_empty() {
			return Err(SubjectError::EmptySubject);
		}
		if subject.len() > MAX_SUBJECT_LENGTH {
			return Err(SubjectError::too_long(subject, MAX_SUBJECT_LENGTH));
		}
		if subject.chars().any(char::is_whitespace) {
			return Err(SubjectError::whitespace(subject));
		}

		let tokens: Vec<&str> = subject.split('.').collect();
		let last = tokens.len() - 1;
		for (index, token) in tokens.iter().enumerate() {
			match *token {
				| "" => {
					return Err(SubjectError::EmptyToken {
						subject: subject.to_string(),
						index,
					});
				}
				| SINGLE_WILDCARD => {}
				| TAIL_WILDCARD if index == last => {}
				| TAIL_WILDCARD => {
					return Err(SubjectError::wildcard_usage(
						subject,
						"> can only be the last token",
					));
				}
				| _ if token.contains(['*', '>']) => {
					return Err(SubjectError::wildcard_usage(
						subject,
						format!("wildcard inside token '{token}'"),
					));
				}
				| _ => {}
			}
		}
		Ok(())
	}

	/// Validates a subject used for publishing; wildcards are rejected.
	pub fn validate_publish_subject(subject: &str) -> Result<(), SubjectError> {
		validate_subject(subject)?;
		if subject
			.split('.')
			.any(|t| t == SINGLE_WILDCARD || t == TAIL_WILDCARD)
		{
			return Err(SubjectError::wildcard_usage(
				subject,
				"wildcards are not allowed when publishing",
			));
		}
		Ok(())
	}

	/// Validates a queue-group name.
	pub fn validate_queue_group(queue_group: &str) -> Result<(), SubjectError> {
		if queue_group.trim().is_empty() {
			return Err(SubjectError::EmptyQueueGroup);
		}
		if queue_group.len() > MAX_SUBJECT_LENGTH {
			return Err(SubjectError::too_long(
				queue_group,
				MAX_SUBJECT_LENGTH,
			));
		}
		if queue_group.chars().any(char::is_whitespace) {
			return Err(SubjectError::whitespace(queue_group));
		}
		if queue_group.contains(['*', '>']) {
			return Err(SubjectError::WildcardQueueGroup {
				queue_group: queue_group.to_string(),
			});
		}
		Ok(())
	}
}
