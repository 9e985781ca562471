//! Stable exit codes for shopper CLI commands.

/// Command succeeded; for `run`, the promo code was applied.
pub const OK: i32 = 0;
/// Invalid config or arguments, or the job failed on an unexpected error.
pub const FAILED: i32 = 1;
/// `shopper run` completed but the promo code was not applied.
pub const NOT_APPLIED: i32 = 2;
/// `shopper run` could not reach any links from the seed URL.
pub const UNREACHABLE: i32 = 3;
