//! Bounded retry shared by every "try candidates until one is confirmed" loop.
//!
//! Each attempt runs an action and, if the action produced something worth
//! checking, a confirmation. The first confirmed attempt wins. The combinator
//! threads an explicit context through both closures so that they can share a
//! driver and oracle session without aliasing borrows.

use anyhow::Result;

/// Result of a bounded retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry<T> {
    /// Attempt `attempt` (0-based) was confirmed.
    Confirmed { attempt: usize, value: T },
    /// All attempts ran without confirmation.
    Exhausted { attempts: usize },
}

impl<T> Retry<T> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Retry::Confirmed { .. })
    }

    pub fn attempts(&self) -> usize {
        match self {
            Retry::Confirmed { attempt, .. } => attempt + 1,
            Retry::Exhausted { attempts } => *attempts,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Retry::Confirmed { value, .. } => Some(value),
            Retry::Exhausted { .. } => None,
        }
    }
}

/// Run up to `max_attempts` attempts of `action`, confirming each with `confirm`.
///
/// `action` returns `None` when the attempt should be abandoned without
/// confirmation (e.g. a click navigated away and was rolled back). `confirm`
/// returns `Some` to accept the attempt. Errors from either closure abort the
/// retry and propagate.
pub fn bounded_retry<C, S, T, A, V>(
    ctx: &mut C,
    max_attempts: usize,
    mut action: A,
    mut confirm: V,
) -> Result<Retry<T>>
where
    C: ?Sized,
    A: FnMut(&mut C, usize) -> Result<Option<S>>,
    V: FnMut(&mut C, usize, S) -> Result<Option<T>>,
{
    for attempt in 0..max_attempts {
        let Some(produced) = action(ctx, attempt)? else {
            continue;
        };
        if let Some(value) = confirm(ctx, attempt, produced)? {
            return Ok(Retry::Confirmed { attempt, value });
        }
    }
    Ok(Retry::Exhausted {
        attempts: max_attempts,
    })
}
