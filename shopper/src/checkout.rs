//! Cart/checkout navigation and promo code redemption.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use minijinja::context;
use tracing::{debug, info, instrument, warn};

use crate::core::links::absolutize;
use crate::core::parse::first_url;
use crate::core::retry::bounded_retry;
use crate::core::types::{Control, PageElement};
use crate::io::driver::{BrowserDriver, ClickMode};
use crate::io::prompt::Query;
use crate::workbench::Workbench;

/// Which page the navigation is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Cart,
    Checkout,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scenario::Cart => "cart",
            Scenario::Checkout => "checkout",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoRedemption {
    pub applied: bool,
    /// Screenshot after the code was typed into the field.
    pub entry_image: Option<PathBuf>,
    /// Screenshot after the apply control was pressed.
    pub apply_image: Option<PathBuf>,
}

impl PromoRedemption {
    fn failed() -> Self {
        Self {
            applied: false,
            entry_image: None,
            apply_image: None,
        }
    }
}

/// Navigate to the cart or checkout page and return a screenshot of where we ended up.
///
/// Best effort: when no candidate is confirmed the last attempted screenshot
/// is returned, or the starting one if there were no candidates.
#[instrument(skip_all, fields(scenario = %scenario))]
pub fn navigate_to_cart_checkout<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    scenario: Scenario,
    start: Option<&str>,
) -> Result<PathBuf> {
    if let Some(url) = start {
        bench.goto(url)?;
    }
    let before = bench.snapshot(&format!("{scenario}_start"))?;
    let page_url = bench.current_url()?;

    let mut elements: Vec<PageElement> = bench
        .driver
        .buttons()?
        .into_iter()
        .map(PageElement::Button)
        .collect();
    elements.extend(bench.driver.links()?.into_iter().map(PageElement::Link));
    let candidates: Vec<PageElement> = bench
        .shopping
        .select(Query::CartCheckoutOptions, context! {}, &elements, &[&before])?
        .into_iter()
        .cloned()
        .collect();
    debug!(offered = elements.len(), candidates = candidates.len(), "entry points ranked");

    let mut last = before.clone();
    let outcome = bounded_retry(
        bench,
        candidates.len(),
        |bench, n| {
            bench.rollback_if_moved(&page_url)?;
            match &candidates[n] {
                PageElement::Link(link) => {
                    let Some(target) = resolve_href(bench, &page_url, &link.href)? else {
                        debug!(href = %link.href, "entry link could not be resolved");
                        return Ok(None);
                    };
                    if let Err(e) = bench.goto(&target) {
                        warn!(err = %e, url = %target, "entry link navigation failed");
                        return Ok(None);
                    }
                }
                PageElement::Button(control) | PageElement::TextField(control) => {
                    if !bench.try_click(control, ClickMode::Single) {
                        return Ok(None);
                    }
                }
            }
            bench.pacer.cart();
            let shot = bench.snapshot(&format!("{scenario}_attempt_{n}"))?;
            last = shot.clone();
            Ok(Some(shot))
        },
        |bench, _, after| {
            let reached = bench.shopping.yes_no(
                Query::CartOrCheckoutReached,
                context! { scenario => scenario.to_string() },
                &[&before, &after],
            )?;
            Ok(reached.then_some(after))
        },
    )?;

    match outcome.into_value() {
        Some(reached) => {
            info!("page reached");
            Ok(reached)
        }
        None => {
            warn!("page not confirmed, continuing from the last attempt");
            Ok(last)
        }
    }
}

/// Absolute URL for `href`, asking the oracle to repair hrefs that do not resolve.
fn resolve_href<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    page_url: &str,
    href: &str,
) -> Result<Option<String>> {
    if let Some(url) = absolutize(page_url, href) {
        return Ok(Some(url));
    }
    let reply = bench.shopping.ask(
        Query::RepairUrl,
        context! { current => page_url, next => href },
        &[],
    )?;
    Ok(first_url(&reply))
}

/// Type `code` into a promo field and press an apply control.
///
/// `cart_image` is the screenshot of the page reached by navigation. Fields are
/// tried in order until one is entered and applied. No promo field candidates
/// means immediate failure without further screenshots, as does an entered
/// field with no apply control candidates.
#[instrument(skip_all)]
pub fn attempt_applying_promo<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    code: &str,
    cart_image: &Path,
) -> Result<PromoRedemption> {
    let fields = bench.driver.text_fields()?;
    let candidates: Vec<Control> = bench
        .shopping
        .select(Query::PromoFields, context! {}, &fields, &[cart_image])?
        .into_iter()
        .cloned()
        .collect();
    if candidates.is_empty() {
        info!(fields = fields.len(), "no promo field found");
        return Ok(PromoRedemption::failed());
    }

    let before = bench.snapshot("prepromo")?;
    for (n, field) in candidates.iter().enumerate() {
        if let Err(e) = bench.driver.type_text(field, code) {
            warn!(err = %e, field = %field, "typing promo code failed");
            continue;
        }
        bench.pacer.action();
        let entered = bench.snapshot(&format!("promo_entered_{n}"))?;
        if !bench
            .shopping
            .yes_no(Query::IsPromoEntered, context! {}, &[&before, &entered])?
        {
            debug!(field = %field, "promo entry not confirmed");
            continue;
        }

        let buttons = bench.driver.buttons()?;
        let applies: Vec<Control> = bench
            .shopping
            .select(Query::ApplyButtons, context! {}, &buttons, &[&entered])?
            .into_iter()
            .cloned()
            .collect();
        if applies.is_empty() {
            info!("no apply control found");
            return Ok(PromoRedemption::failed());
        }

        let outcome = bounded_retry(
            bench,
            applies.len(),
            |bench, k| {
                if !bench.try_click(&applies[k], ClickMode::Single) {
                    return Ok(None);
                }
                bench.pacer.apply();
                Ok(Some(bench.snapshot(&format!("promo_applied_{n}_{k}"))?))
            },
            |bench, _, after| {
                let pressed = bench.shopping.yes_no(
                    Query::IsPromoApplied,
                    context! {},
                    &[&entered, &after],
                )?;
                Ok(pressed.then_some(after))
            },
        )?;
        match outcome.into_value() {
            Some(after) => {
                info!("promo code applied");
                return Ok(PromoRedemption {
                    applied: true,
                    entry_image: Some(entered),
                    apply_image: Some(after),
                });
            }
            None => info!(tried = applies.len(), field = %field, "no apply control confirmed"),
        }
    }
    Ok(PromoRedemption::failed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePage, FakeSite, ScriptedOracle, SiteEvent, with_bench};

    const CART_PAGE: &str = "https://shop.test/cart";

    fn cart_site(fields: &[&str], buttons: &[&str]) -> FakeSite {
        FakeSite::new().page(
            CART_PAGE,
            FakePage::new().text_fields(fields).buttons(buttons),
        )
    }

    #[test]
    fn empty_promo_fields_fail_without_screenshots() {
        let shopping = ScriptedOracle::new();
        let verifier = ScriptedOracle::new();
        let mut site = cart_site(&[], &["Checkout"]);
        site.navigate(CART_PAGE).expect("navigate");

        let redemption = with_bench(&mut site, &shopping, &verifier, |bench| {
            attempt_applying_promo(bench, "SAVE10", Path::new("cart.png"))
        })
        .expect("redeem");

        assert_eq!(redemption, PromoRedemption::failed());
        assert_eq!(site.screenshot_count(), 0);
        assert!(shopping.calls().is_empty());
    }

    #[test]
    fn confirmed_entry_and_apply_succeed() {
        let shopping = ScriptedOracle::new()
            .reply(Query::PromoFields, "1")
            .reply(Query::IsPromoEntered, "Yes")
            .reply(Query::ApplyButtons, "2")
            .reply(Query::IsPromoApplied, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = cart_site(&["coupon"], &["Checkout", "Apply"]);
        site.navigate(CART_PAGE).expect("navigate");

        let redemption = with_bench(&mut site, &shopping, &verifier, |bench| {
            attempt_applying_promo(bench, "SAVE10", Path::new("cart.png"))
        })
        .expect("redeem");

        assert!(redemption.applied);
        let apply_image = redemption.apply_image.expect("apply image");
        assert!(apply_image.ends_with("promo_applied_0_0.png"));
        assert!(redemption.entry_image.is_some());
        assert_eq!(
            site.count(&SiteEvent::Type {
                field: "coupon".to_string(),
                text: "SAVE10".to_string()
            }),
            1
        );
        assert_eq!(site.clicks(), vec!["Apply"]);
    }

    #[test]
    fn unconfirmed_entry_moves_to_next_field() {
        let shopping = ScriptedOracle::new()
            .reply(Query::PromoFields, "1 2")
            .replies(Query::IsPromoEntered, &["No", "Yes"])
            .reply(Query::ApplyButtons, "1")
            .reply(Query::IsPromoApplied, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = cart_site(&["search", "coupon"], &["Apply"]);
        site.navigate(CART_PAGE).expect("navigate");

        let redemption = with_bench(&mut site, &shopping, &verifier, |bench| {
            attempt_applying_promo(bench, "SAVE10", Path::new("cart.png"))
        })
        .expect("redeem");

        assert!(redemption.applied);
        assert!(
            redemption
                .entry_image
                .expect("entry image")
                .ends_with("promo_entered_1.png")
        );
    }

    #[test]
    fn missing_apply_control_fails() {
        let shopping = ScriptedOracle::new()
            .reply(Query::PromoFields, "1")
            .reply(Query::IsPromoEntered, "Yes")
            .reply(Query::ApplyButtons, "-1");
        let verifier = ScriptedOracle::new();
        let mut site = cart_site(&["coupon"], &["Checkout"]);
        site.navigate(CART_PAGE).expect("navigate");

        let redemption = with_bench(&mut site, &shopping, &verifier, |bench| {
            attempt_applying_promo(bench, "SAVE10", Path::new("cart.png"))
        })
        .expect("redeem");

        assert!(!redemption.applied);
        assert!(site.clicks().is_empty());
    }

    #[test]
    fn unpressed_apply_controls_move_on_to_the_next_field() {
        let shopping = ScriptedOracle::new()
            .reply(Query::PromoFields, "1 2")
            .default_reply(Query::IsPromoEntered, "Yes")
            .default_reply(Query::ApplyButtons, "1 2")
            .default_reply(Query::IsPromoApplied, "No");
        let verifier = ScriptedOracle::new();
        let mut site = cart_site(&["coupon", "gift"], &["Apply", "Redeem"]);
        site.navigate(CART_PAGE).expect("navigate");

        let redemption = with_bench(&mut site, &shopping, &verifier, |bench| {
            attempt_applying_promo(bench, "SAVE10", Path::new("cart.png"))
        })
        .expect("redeem");

        assert!(!redemption.applied);
        assert_eq!(site.clicks(), vec!["Apply", "Redeem", "Apply", "Redeem"]);
        assert_eq!(shopping.call_count(Query::IsPromoEntered), 2);
        assert_eq!(shopping.call_count(Query::IsPromoApplied), 4);
    }

    #[test]
    fn second_field_applies_after_first_field_fails() {
        let shopping = ScriptedOracle::new()
            .reply(Query::PromoFields, "1 2")
            .default_reply(Query::IsPromoEntered, "Yes")
            .default_reply(Query::ApplyButtons, "1")
            .reply(Query::IsPromoApplied, "No")
            .reply(Query::IsPromoApplied, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = cart_site(&["coupon", "gift"], &["Apply"]);
        site.navigate(CART_PAGE).expect("navigate");

        let redemption = with_bench(&mut site, &shopping, &verifier, |bench| {
            attempt_applying_promo(bench, "SAVE10", Path::new("cart.png"))
        })
        .expect("redeem");

        assert!(redemption.applied);
        assert!(
            redemption
                .entry_image
                .as_ref()
                .expect("entry image")
                .ends_with("promo_entered_1.png")
        );
        assert!(
            redemption
                .apply_image
                .as_ref()
                .expect("apply image")
                .ends_with("promo_applied_1_0.png")
        );
        assert_eq!(
            site.count(&SiteEvent::Type {
                field: "gift".to_string(),
                text: "SAVE10".to_string()
            }),
            1
        );
    }

    #[test]
    fn cart_link_is_resolved_against_current_page() {
        let shopping = ScriptedOracle::new()
            .reply(Query::CartCheckoutOptions, "2")
            .reply(Query::CartOrCheckoutReached, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(
            "https://shop.test/",
            FakePage::new().buttons(&["Add to cart"]).links(&["/cart"]),
        );

        let image = with_bench(&mut site, &shopping, &verifier, |bench| {
            navigate_to_cart_checkout(bench, Scenario::Cart, Some("https://shop.test/"))
        })
        .expect("navigate");

        assert!(image.ends_with("cart_attempt_0.png"));
        assert_eq!(site.navigations(), vec!["https://shop.test/", CART_PAGE]);
        let reached = &shopping.calls_for(Query::CartOrCheckoutReached)[0];
        assert!(reached.prompt.contains("cart page"));
        assert_eq!(reached.images.len(), 2);
    }

    #[test]
    fn unresolvable_href_is_repaired() {
        let shopping = ScriptedOracle::new()
            .reply(Query::CartCheckoutOptions, "1")
            .reply(Query::RepairUrl, "https://shop.test/checkout")
            .reply(Query::CartOrCheckoutReached, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(
            "https://shop.test/cart",
            FakePage::new().links(&["javascript:void(0)"]),
        );
        site.navigate(CART_PAGE).expect("navigate");

        with_bench(&mut site, &shopping, &verifier, |bench| {
            navigate_to_cart_checkout(bench, Scenario::Checkout, None)
        })
        .expect("navigate");

        assert_eq!(site.navigations().last().copied(), Some("https://shop.test/checkout"));
    }

    #[test]
    fn unconfirmed_candidates_return_last_attempt() {
        let shopping = ScriptedOracle::new()
            .reply(Query::CartCheckoutOptions, "1 2")
            .default_reply(Query::CartOrCheckoutReached, "No");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new()
            .page("https://shop.test/", FakePage::new().buttons(&["Bag", "Basket"]))
            .on_click("Bag", "https://shop.test/bag");

        let image = with_bench(&mut site, &shopping, &verifier, |bench| {
            navigate_to_cart_checkout(bench, Scenario::Cart, Some("https://shop.test/"))
        })
        .expect("navigate");

        assert!(image.ends_with("cart_attempt_1.png"));
        assert_eq!(site.clicks(), vec!["Bag", "Basket"]);
        // back to the start page before the second candidate
        assert_eq!(
            site.navigations(),
            vec!["https://shop.test/", "https://shop.test/"]
        );
    }
}
