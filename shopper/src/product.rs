//! Per-product state machine: clear overlays, read the product, check it
//! against the criterion, apply required customizations and add it to the cart.
//!
//! Every candidate search (overlay buttons, option buttons, add buttons) runs
//! through [`bounded_retry`]: act on one candidate, take an after-screenshot,
//! let the oracle confirm. A click that moves the browser to another page is
//! rolled back and counts as a failed candidate.

use std::path::{Path, PathBuf};

use anyhow::Result;
use minijinja::context;
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use crate::core::parse::{customization_needs, failure_cause, is_yes, lines_to_map};
use crate::core::retry::bounded_retry;
use crate::core::types::{AddedProducts, Control, Criterion, ProductDetails};
use crate::io::config::ProductConfig;
use crate::io::driver::{BrowserDriver, ClickMode};
use crate::io::prompt::{Query, truncate_to_budget};
use crate::workbench::Workbench;

/// One product page to process.
#[derive(Debug, Clone)]
pub struct ProductTask<'a> {
    pub index: usize,
    pub link: &'a str,
    pub source: Option<&'a str>,
    /// Only the first processed product looks for blocking overlays.
    pub clear_overlay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductVerdict {
    /// The verifier judged the product outside the promo criterion.
    Ineligible,
    Added { quantity: u32 },
    NotAdded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductReport {
    pub details: ProductDetails,
    pub verdict: ProductVerdict,
}

/// Process one product page, appending it to `added` when it lands in the cart.
#[instrument(skip_all, fields(index = task.index, link = %task.link))]
pub fn process_product<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    criterion: &Criterion,
    cfg: &ProductConfig,
    task: &ProductTask<'_>,
    added: &mut AddedProducts,
) -> Result<ProductReport> {
    let index = task.index;
    bench.goto(task.link)?;
    let initial = bench.snapshot(&format!("product_{index}_landing_initial"))?;

    if task.clear_overlay {
        clear_overlay(bench, index, cfg.overlay_attempts, &initial)?;
    }

    let image = bench.snapshot(&format!("product_{index}_landing"))?;
    let page_text = match bench.driver.body_text() {
        Ok(text) => truncate_to_budget(&text, cfg.page_text_limit_bytes),
        Err(e) => {
            warn!(err = %e, "product page text unavailable");
            String::new()
        }
    };
    let mut details = extract_details(bench, task, &image, &page_text)?;

    let (eligible, verdict) = bench.verifier.yes_no_explained(
        Query::IsApplicable,
        context! { criterion => criterion.as_str(), details => details.summary() },
        &[&image],
    )?;
    details.applicability = Some(verdict);
    if !eligible {
        info!("product does not fit the criterion");
        return Ok(ProductReport {
            details,
            verdict: ProductVerdict::Ineligible,
        });
    }

    apply_required_customizations(bench, criterion, cfg, index, &details, added, &image)?;

    let verdict = add_to_cart(bench, criterion, cfg, index, &mut details, added)?;
    Ok(ProductReport { details, verdict })
}

/// Dismiss a blocking overlay if the oracle sees one.
///
/// Returns false when the overlay survived every attempt; the caller carries
/// on regardless.
fn clear_overlay<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    index: usize,
    attempts: usize,
    initial: &Path,
) -> Result<bool> {
    if !bench.shopping.yes_no(Query::HasOverlay, context! {}, &[initial])? {
        return Ok(true);
    }
    info!("overlay detected");
    let start_url = bench.current_url()?;
    let overlay_image = bench.snapshot(&format!("product_{index}_overlay"))?;

    let outcome = bounded_retry(
        bench,
        attempts,
        |bench, attempt| {
            dismiss_overlay(bench, index, attempt, &start_url, &overlay_image)?;
            Ok(Some(()))
        },
        |bench, attempt, ()| {
            let check = bench.snapshot(&format!("product_{index}_overlay_check_{attempt}"))?;
            let present = bench
                .shopping
                .yes_no(Query::HasOverlay, context! {}, &[&check])?;
            Ok((!present).then_some(()))
        },
    )?;
    if !outcome.is_confirmed() {
        warn!(attempts, "overlay still detected, assuming it is cleared");
    }
    Ok(outcome.is_confirmed())
}

fn dismiss_overlay<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    index: usize,
    attempt: usize,
    start_url: &str,
    overlay_image: &Path,
) -> Result<bool> {
    let buttons = bench.driver.buttons()?;
    let mut candidates: Vec<Control> = Vec::new();
    for button in bench
        .shopping
        .select(Query::OverlayCloseButtons, context! {}, &buttons, &[overlay_image])?
    {
        if !candidates.contains(button) {
            candidates.push(button.clone());
        }
    }
    debug!(candidates = candidates.len(), "overlay close candidates");

    let outcome = bounded_retry(
        bench,
        candidates.len(),
        |bench, n| {
            bench.try_click(&candidates[n], ClickMode::First);
            bench.rollback_if_moved(start_url)?;
            let shot = bench.snapshot(&format!("product_{index}_overlay_{attempt}_{n}"))?;
            Ok(Some(shot))
        },
        |bench, _, shot| {
            let present = bench
                .shopping
                .yes_no(Query::HasOverlay, context! {}, &[&shot])?;
            Ok((!present).then_some(()))
        },
    )?;
    Ok(outcome.is_confirmed())
}

fn extract_details<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    task: &ProductTask<'_>,
    image: &Path,
    page_text: &str,
) -> Result<ProductDetails> {
    let mut details = ProductDetails {
        link: task.link.to_string(),
        source: task.source.map(str::to_string),
        ..ProductDetails::default()
    };

    let reply = bench.shopping.ask(
        Query::ProductDetails,
        context! { page_text => page_text },
        &[image],
    )?;
    for (key, value) in lines_to_map(&reply) {
        match normalize_key(&key).as_str() {
            "productname" | "name" => details.name = Some(value),
            "price" => details.price = Some(value),
            "category" => details.category = Some(value),
            "validproduct" | "valid" => {
                details.valid = Some(is_yes(&value) || value.eq_ignore_ascii_case("true"));
            }
            _ => {
                details.extra.insert(key, value);
            }
        }
    }

    let options = bench
        .shopping
        .ask(Query::ProductOptions, context! {}, &[image])?;
    details.customizations = lines_to_map(&options);

    if !details.customizations.is_empty() {
        let listing = details
            .customizations
            .iter()
            .map(|(group, values)| format!("{group}: {values}"))
            .collect::<Vec<_>>()
            .join("\n");
        let needs = bench.shopping.ask(
            Query::EssentialCustomizations,
            context! { options => listing },
            &[image],
        )?;
        details.essential_customizations = customization_needs(&needs);
    }
    debug!(name = ?details.name, groups = details.customizations.len(), "product details extracted");
    Ok(details)
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn apply_required_customizations<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    criterion: &Criterion,
    cfg: &ProductConfig,
    index: usize,
    details: &ProductDetails,
    added: &AddedProducts,
    image: &Path,
) -> Result<()> {
    let added_summary = if added.is_empty() {
        String::new()
    } else {
        added.summary()
    };
    for (group, values) in &details.customizations {
        let required = bench.shopping.yes_no(
            Query::CustomizationRequired,
            context! {
                criterion => criterion.as_str(),
                details => details.summary(),
                added => &added_summary,
                group => group,
            },
            &[image],
        )?;
        if !required {
            debug!(group = %group, "customization not required");
            continue;
        }

        let targets = bench.shopping.ask(
            Query::OptionSelection,
            context! { criterion => criterion.as_str(), group => group, options => values },
            &[image],
        )?;
        if bench
            .shopping
            .yes_no(Query::IsPreselected, context! { group => group }, &[image])?
        {
            debug!(group = %group, "option already preselected");
            continue;
        }

        let applied =
            apply_customization_with_retry(bench, index, group, &targets, cfg.customization_retries)?;
        info!(group = %group, targets = %targets, applied, "customization attempted");
    }
    Ok(())
}

fn apply_customization_with_retry<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    index: usize,
    group: &str,
    options: &str,
    retries: usize,
) -> Result<bool> {
    let outcome = bounded_retry(
        bench,
        retries,
        |bench, attempt| {
            let label = format!("{index}_{attempt}");
            Ok(Some(apply_customization(bench, &label, group, options)?))
        },
        |_, _, applied| Ok(applied.then_some(())),
    )?;
    Ok(outcome.is_confirmed())
}

/// Click option buttons for `group` until the oracle sees the change applied.
fn apply_customization<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    label: &str,
    group: &str,
    options: &str,
) -> Result<bool> {
    let before = bench.snapshot(&format!("product_{label}_custom_{group}"))?;
    let buttons = bench.driver.buttons()?;
    let candidates: Vec<Control> = bench
        .shopping
        .select(
            Query::CustomizationButtons,
            context! { group => group, options => options },
            &buttons,
            &[&before],
        )?
        .into_iter()
        .cloned()
        .collect();
    let start_url = bench.current_url()?;

    let outcome = bounded_retry(
        bench,
        candidates.len(),
        |bench, n| {
            if !bench.try_click(&candidates[n], ClickMode::First) {
                return Ok(None);
            }
            if bench.rollback_if_moved(&start_url)? {
                debug!(group = %group, "option button left the product page");
                return Ok(None);
            }
            Ok(Some(bench.snapshot(&format!("product_{label}_custom_{group}_{n}"))?))
        },
        |bench, _, after| {
            let applied = bench.shopping.yes_no(
                Query::IsCustomizationApplied,
                context! { group => group },
                &[&before, &after],
            )?;
            Ok(applied.then_some(()))
        },
    )?;
    Ok(outcome.is_confirmed())
}

struct AddAttempt {
    added: bool,
    /// Last screenshot taken, used to diagnose a failure.
    image: PathBuf,
}

/// Try the add-to-cart buttons the oracle suggests, in random order.
fn attempt_add<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    index: usize,
    round: u32,
    tries: usize,
) -> Result<AddAttempt> {
    let start_url = bench.current_url()?;
    let buttons = bench.driver.buttons()?;
    let before = bench.snapshot(&format!("product_{index}_q{round}_t{tries}_before_add"))?;
    let mut candidates: Vec<Control> = bench
        .shopping
        .select(Query::AddToCartButtons, context! {}, &buttons, &[&before])?
        .into_iter()
        .cloned()
        .collect();
    candidates.shuffle(&mut *bench.rng);

    let mut last_image = before.clone();
    let outcome = bounded_retry(
        bench,
        candidates.len(),
        |bench, n| {
            if !bench.try_click(&candidates[n], ClickMode::Single) {
                return Ok(None);
            }
            if bench.rollback_if_moved(&start_url)? {
                debug!("add button left the product page");
                return Ok(None);
            }
            let shot = bench.snapshot(&format!("product_{index}_q{round}_t{tries}_add_{n}"))?;
            last_image = shot.clone();
            Ok(Some(shot))
        },
        |bench, _, after| {
            let added = bench
                .shopping
                .yes_no(Query::IsProductAdded, context! {}, &[&before, &after])?;
            Ok(added.then_some(()))
        },
    )?;
    Ok(AddAttempt {
        added: outcome.is_confirmed(),
        image: last_image,
    })
}

fn add_to_cart<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    criterion: &Criterion,
    cfg: &ProductConfig,
    index: usize,
    details: &mut ProductDetails,
    added: &mut AddedProducts,
) -> Result<ProductVerdict> {
    let start_url = bench.current_url()?;

    let outcome = bounded_retry(
        bench,
        cfg.add_to_cart_tries,
        |bench, tries| Ok(Some(attempt_add(bench, index, 0, tries)?)),
        |bench, tries, attempt| {
            if attempt.added {
                return Ok(Some(()));
            }
            diagnose_failed_add(bench, index, tries, &attempt.image)?;
            Ok(None)
        },
    )?;
    if !outcome.is_confirmed() {
        info!(tries = cfg.add_to_cart_tries, "product could not be added");
        return Ok(ProductVerdict::NotAdded);
    }

    let mut quantity = 1u32;
    details.quantity_added = quantity;
    let slot = added.push(details.clone());
    info!(quantity, "product added to cart");

    let mut rounds = 0u32;
    while rounds < cfg.quantity_escalation_cap
        && bench.shopping.yes_no(
            Query::NeedsMoreQuantity,
            context! { criterion => criterion.as_str(), details => details.summary() },
            &[],
        )?
    {
        rounds += 1;
        bench.goto(&start_url)?;
        let attempt = attempt_add(bench, index, quantity, 0)?;
        if !attempt.added {
            debug!(quantity, "quantity escalation stopped");
            break;
        }
        quantity += 1;
        details.quantity_added = quantity;
        added.record_quantity(slot, quantity);
        info!(quantity, "quantity increased");
    }
    Ok(ProductVerdict::Added { quantity })
}

/// Ask why an add failed and re-apply the customization it names, if any.
fn diagnose_failed_add<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    index: usize,
    tries: usize,
    image: &Path,
) -> Result<()> {
    let reply = bench
        .shopping
        .ask(Query::CauseOfFailure, context! {}, &[image])?;
    match failure_cause(&reply) {
        Ok(Some(cause)) => {
            let label = format!("{index}_fix{tries}");
            let fixed = apply_customization(bench, &label, &cause.group, &cause.value)?;
            info!(group = %cause.group, value = %cause.value, fixed, "re-applied customization after failed add");
        }
        Ok(None) => debug!("no evident cause for failed add"),
        Err(e) => debug!(err = %e, "unusable failure diagnosis"),
    }
    Ok(())
}
