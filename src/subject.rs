//! Subject handling module
//!
//! Validation of subjects and queue-group names against the protocol's
//! naming rules, plus token-wise wildcard matching used by the in-process
//! connection to route published messages.

pub mod error;
pub mod subject_matcher;


pub use error::{SubjectError, SubjectResult};
pub use error::{limits, validation};
pub use subject_matcher::subject_matches;
