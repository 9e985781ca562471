//! Prompt templates for every oracle query the agent makes.
//!
//! Each [`Query`] owns one minijinja template under `prompts/` and a fixed
//! answer-format instruction. Derived query shapes (yes/no, indexed selection)
//! supply their own instructions in [`crate::io::oracle`].

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, Value};
use serde::Serialize;
use tracing::debug;

/// Identifies one kind of oracle question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    GenerateCriterion,
    VerifyCriterion,
    FilterLinks,
    SiftLinks,
    ConsolidateCandidates,
    IsUrlValid,
    RepairUrl,
    HasOverlay,
    OverlayCloseButtons,
    ProductDetails,
    ProductOptions,
    EssentialCustomizations,
    IsApplicable,
    CustomizationRequired,
    OptionSelection,
    IsPreselected,
    CustomizationButtons,
    IsCustomizationApplied,
    AddToCartButtons,
    IsProductAdded,
    NeedsMoreQuantity,
    CauseOfFailure,
    CriteriaMet,
    CartCheckoutOptions,
    CartOrCheckoutReached,
    HasPromoField,
    PromoFields,
    IsPromoEntered,
    ApplyButtons,
    IsPromoApplied,
    FinalOutcome,
}

impl Query {
    pub const ALL: [Query; 31] = [
        Query::GenerateCriterion,
        Query::VerifyCriterion,
        Query::FilterLinks,
        Query::SiftLinks,
        Query::ConsolidateCandidates,
        Query::IsUrlValid,
        Query::RepairUrl,
        Query::HasOverlay,
        Query::OverlayCloseButtons,
        Query::ProductDetails,
        Query::ProductOptions,
        Query::EssentialCustomizations,
        Query::IsApplicable,
        Query::CustomizationRequired,
        Query::OptionSelection,
        Query::IsPreselected,
        Query::CustomizationButtons,
        Query::IsCustomizationApplied,
        Query::AddToCartButtons,
        Query::IsProductAdded,
        Query::NeedsMoreQuantity,
        Query::CauseOfFailure,
        Query::CriteriaMet,
        Query::CartCheckoutOptions,
        Query::CartOrCheckoutReached,
        Query::HasPromoField,
        Query::PromoFields,
        Query::IsPromoEntered,
        Query::ApplyButtons,
        Query::IsPromoApplied,
        Query::FinalOutcome,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Query::GenerateCriterion => "generate_criterion",
            Query::VerifyCriterion => "verify_criterion",
            Query::FilterLinks => "filter_links",
            Query::SiftLinks => "sift_links",
            Query::ConsolidateCandidates => "consolidate_candidates",
            Query::IsUrlValid => "is_url_valid",
            Query::RepairUrl => "repair_url",
            Query::HasOverlay => "has_overlay",
            Query::OverlayCloseButtons => "overlay_close_buttons",
            Query::ProductDetails => "product_details",
            Query::ProductOptions => "product_options",
            Query::EssentialCustomizations => "essential_customizations",
            Query::IsApplicable => "is_applicable",
            Query::CustomizationRequired => "customization_required",
            Query::OptionSelection => "option_selection",
            Query::IsPreselected => "is_preselected",
            Query::CustomizationButtons => "customization_buttons",
            Query::IsCustomizationApplied => "is_customization_applied",
            Query::AddToCartButtons => "add_to_cart_buttons",
            Query::IsProductAdded => "is_product_added",
            Query::NeedsMoreQuantity => "needs_more_quantity",
            Query::CauseOfFailure => "cause_of_failure",
            Query::CriteriaMet => "criteria_met",
            Query::CartCheckoutOptions => "cart_checkout_options",
            Query::CartOrCheckoutReached => "cart_or_checkout_reached",
            Query::HasPromoField => "has_promo_field",
            Query::PromoFields => "promo_fields",
            Query::IsPromoEntered => "is_promo_entered",
            Query::ApplyButtons => "apply_buttons",
            Query::IsPromoApplied => "is_promo_applied",
            Query::FinalOutcome => "final_outcome",
        }
    }

    fn template(self) -> &'static str {
        match self {
            Query::GenerateCriterion => include_str!("prompts/generate_criterion.md"),
            Query::VerifyCriterion => include_str!("prompts/verify_criterion.md"),
            Query::FilterLinks => include_str!("prompts/filter_links.md"),
            Query::SiftLinks => include_str!("prompts/sift_links.md"),
            Query::ConsolidateCandidates => include_str!("prompts/consolidate_candidates.md"),
            Query::IsUrlValid => include_str!("prompts/is_url_valid.md"),
            Query::RepairUrl => include_str!("prompts/repair_url.md"),
            Query::HasOverlay => include_str!("prompts/has_overlay.md"),
            Query::OverlayCloseButtons => include_str!("prompts/overlay_close_buttons.md"),
            Query::ProductDetails => include_str!("prompts/product_details.md"),
            Query::ProductOptions => include_str!("prompts/product_options.md"),
            Query::EssentialCustomizations => include_str!("prompts/essential_customizations.md"),
            Query::IsApplicable => include_str!("prompts/is_applicable.md"),
            Query::CustomizationRequired => include_str!("prompts/customization_required.md"),
            Query::OptionSelection => include_str!("prompts/option_selection.md"),
            Query::IsPreselected => include_str!("prompts/is_preselected.md"),
            Query::CustomizationButtons => include_str!("prompts/customization_buttons.md"),
            Query::IsCustomizationApplied => include_str!("prompts/is_customization_applied.md"),
            Query::AddToCartButtons => include_str!("prompts/add_to_cart_buttons.md"),
            Query::IsProductAdded => include_str!("prompts/is_product_added.md"),
            Query::NeedsMoreQuantity => include_str!("prompts/needs_more_quantity.md"),
            Query::CauseOfFailure => include_str!("prompts/cause_of_failure.md"),
            Query::CriteriaMet => include_str!("prompts/criteria_met.md"),
            Query::CartCheckoutOptions => include_str!("prompts/cart_checkout_options.md"),
            Query::CartOrCheckoutReached => include_str!("prompts/cart_or_checkout_reached.md"),
            Query::HasPromoField => include_str!("prompts/has_promo_field.md"),
            Query::PromoFields => include_str!("prompts/promo_fields.md"),
            Query::IsPromoEntered => include_str!("prompts/is_promo_entered.md"),
            Query::ApplyButtons => include_str!("prompts/apply_buttons.md"),
            Query::IsPromoApplied => include_str!("prompts/is_promo_applied.md"),
            Query::FinalOutcome => include_str!("prompts/final_outcome.md"),
        }
    }

    /// Answer-format instruction for free-text queries.
    pub fn instructions(self) -> &'static str {
        match self {
            Query::GenerateCriterion => CRITERION_FORMAT,
            Query::VerifyCriterion => {
                "Start with either a Yes or No. If No, then continue to briefly explain why (very concisely)."
            }
            Query::SiftLinks => {
                "Respond with links only, one per line, each prefixed with 'ADD:' or 'BROWSE:'."
            }
            Query::ConsolidateCandidates => {
                "Respond with selected links, one per line. Select the ones that are more probable to point to a product buying page."
            }
            Query::RepairUrl => "Respond with one url in one line.",
            Query::ProductDetails => {
                "Respond with details in the format: 'Detail type : Detail' in each line. Respond with 'None' if there are no details."
            }
            Query::ProductOptions => {
                "Respond with options that must be selected before adding to cart, in the format: 'Option type : Options' in each line. Respond with 'None' if there are no options."
            }
            Query::EssentialCustomizations => {
                "Respond in the following format in each line\nOption Name: Either 'required' or 'default'"
            }
            Query::OptionSelection => "Only respond with one or more of the listed options.",
            Query::CauseOfFailure => {
                "Respond with a brief explanation in one line, in format as 'Cause (one or two words)':'some detail such as missing setting or incorrect value etc'. If no reason is evident, respond with 'None'"
            }
            Query::FinalOutcome => {
                "Start the response with one word about the promo application status, such as APPLIED/EXPIRED/INAPPLICABLE/NONEXISTENT, whichever is appropriate. Afterwards, detail the effects it had if any, such as reduction in price, removed shipping fees, or an error message."
            }
            _ => "",
        }
    }
}

const CRITERION_FORMAT: &str = "Adhere to this format:
Promo Description: (repeat the promo description here)
Product Categories: (specify if only specific categories are explicitly defined)
Product Quantities: (specify if any quantity criteria is explicitly defined and needs to be met)
Product Prices: (specify if any price criteria for applicable products or total price is explicitly defined)
Specific Conditions: (specify if any additional conditions other than above are explicitly defined to apply the promo)
Discount Effect: (specify what benefit the discount/promotion will provide, this will be verified at the end)";

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        for query in Query::ALL {
            env.add_template(query.name(), query.template())
                .expect("prompt templates should be valid");
        }
        Self { env }
    }

    fn render(&self, query: Query, ctx: Value) -> Result<String> {
        let template = self
            .env
            .get_template(query.name())
            .with_context(|| format!("load template {}", query.name()))?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render template {}", query.name()))?;
        Ok(rendered.trim().to_string())
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Render the prompt for `query` with the given template context.
pub fn render(query: Query, ctx: Value) -> Result<String> {
    ENGINE.render(query, ctx)
}

/// Clamp prompt material (page text, long lists) to a byte budget.
pub fn truncate_to_budget(text: &str, budget: usize) -> String {
    let text = text.trim();
    if text.len() <= budget {
        return text.to_string();
    }
    let mut cut = budget.saturating_sub(12);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!(
        before_len = text.len(),
        after_len = cut,
        "truncated prompt material for budget"
    );
    format!("{}\n[truncated]", &text[..cut])
}
