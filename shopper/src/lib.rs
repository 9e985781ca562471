//! Browsing agent that finds products eligible for a promotion, adds them to
//! the cart and redeems the promo code.
//!
//! Every judgment that needs eyes on the page (which button to press, whether
//! an overlay is in the way, whether the code applied) is delegated to an
//! external oracle. The crate supplies the control logic around it:
//!
//! - **[`core`]**: Pure logic (reply parsing, link frontier, retry combinator).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (browser drivers, oracle process,
//!   prompts, config, job artifacts). Behind traits so tests can script them.
//!
//! Phase modules ([`criterion`], [`discovery`], [`product`], [`checkout`]) act
//! through a [`workbench::Workbench`]; [`job`] sequences them into one run.

pub mod checkout;
pub mod core;
pub mod criterion;
pub mod discovery;
pub mod exit_codes;
pub mod io;
pub mod job;
pub mod logging;
pub mod product;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workbench;
