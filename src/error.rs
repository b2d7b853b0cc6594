/*!
 * Error Types
 *
 * The only recoverable error in this crate is a wait timeout. Everything
 * else in the taxonomy is either a programming error (unlock without hold,
 * destroying a locked mutex) or an unexpected kernel result, both of which
 * abort the calling thread via panic, or a predicate panic, which is
 * captured and re-raised on the waiting thread.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for blocking operations that accept a deadline
pub type WaitResult<T> = Result<T, WaitError>;

/// Wait operation errors with serialization support
#[derive(Error, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum WaitError {
    #[error("Wait operation timed out")]
    Timeout,
}
