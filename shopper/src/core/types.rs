//! Shared record types passed between the phases of a job.
//!
//! Page elements arrive from the browser driver as attribute-bearing records and
//! are only ever rendered into prompts or handed back to the driver. Product and
//! outcome records are serialized into the job's `outcome.json`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Driver-supplied attributes of a page element (tag, text, id, aria labels, ...).
pub type Attributes = BTreeMap<String, String>;

/// A clickable or typeable control enumerated from the current page.
///
/// `element_ref` is an opaque driver handle; it is only valid until the next
/// navigation. Drivers fall back to attribute matching when it is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_ref: Option<String>,
}

impl Control {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .attributes
            .iter()
            .map(|(key, value)| format!("{key}={}", single_line(value)))
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&rendered)
    }
}

/// A link enumerated from the current page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub href: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl fmt::Display for LinkRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "href={}", single_line(&self.href))?;
        for (key, value) in &self.attributes {
            write!(f, ", {key}={}", single_line(value))?;
        }
        Ok(())
    }
}

/// Any element the oracle may be asked to choose between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageElement {
    Button(Control),
    Link(LinkRecord),
    TextField(Control),
}

impl fmt::Display for PageElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageElement::Button(control) => write!(f, "button: {control}"),
            PageElement::Link(link) => write!(f, "link: {link}"),
            PageElement::TextField(control) => write!(f, "text field: {control}"),
        }
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

/// Structured promo eligibility rules synthesized for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Criterion(String);

impl Criterion {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an option group must be chosen by the buyer before adding to cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomizationNeed {
    Required,
    Default,
}

/// Everything learned about one product page.
///
/// `quantity_added` is the only field that changes after extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: Option<String>,
    pub price: Option<String>,
    pub category: Option<String>,
    pub valid: Option<bool>,
    pub link: String,
    pub source: Option<String>,
    /// Option group -> offered values, as read off the page.
    pub customizations: BTreeMap<String, String>,
    pub essential_customizations: BTreeMap<String, CustomizationNeed>,
    /// Verifier's eligibility answer, including its one-line rationale.
    pub applicability: Option<String>,
    /// Details the oracle reported that have no dedicated field.
    pub extra: BTreeMap<String, String>,
    pub quantity_added: u32,
}

impl ProductDetails {
    /// Compact JSON rendering used inside prompts.
    pub fn summary(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.link.clone())
    }
}

/// Products confirmed in the cart, in the order they were added.
///
/// Entries are never removed or reordered; only the quantity of an entry can
/// grow when the same product is added again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddedProducts(Vec<ProductDetails>);

impl AddedProducts {
    /// Append a product and return its slot for later quantity updates.
    pub fn push(&mut self, details: ProductDetails) -> usize {
        self.0.push(details);
        self.0.len() - 1
    }

    /// Raise the recorded quantity of an existing entry. Lower values are ignored.
    pub fn record_quantity(&mut self, slot: usize, quantity: u32) {
        if let Some(entry) = self.0.get_mut(slot)
            && quantity > entry.quantity_added
        {
            entry.quantity_added = quantity;
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProductDetails> {
        self.0.iter()
    }

    pub fn summary(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// One unit of work handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub target_url: String,
    pub promo_description: String,
    pub promo_code: String,
}

/// Terminal record of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub promo_applied: bool,
    pub criterion: Criterion,
    pub added_products: AddedProducts,
    /// Leading status word of the final verdict (e.g. `APPLIED`, `EXPIRED`).
    pub verdict_label: Option<String>,
    pub final_verdict_text: String,
    pub before_image: Option<PathBuf>,
    pub after_image: Option<PathBuf>,
}

/// Job-level status reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The pipeline ran to completion; `promo_applied` says whether redemption worked.
    Processed,
    /// No links were reachable from the seed URL with either driver.
    Unreachable,
    /// The pipeline stopped on an unexpected error.
    Failed,
}

/// Result record for the job boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub outcome: Option<JobOutcome>,
    pub error: Option<String>,
    /// Representative image: the post-apply screenshot when redemption succeeded.
    pub image: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(pairs: &[(&str, &str)]) -> Control {
        Control {
            attributes: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            element_ref: None,
        }
    }

    #[test]
    fn control_renders_on_one_line() {
        let button = control(&[("tag", "button"), ("text", "Add\nto cart")]);
        assert_eq!(button.to_string(), "tag=button, text=Add to cart");
    }

    #[test]
    fn page_element_is_tagged() {
        let link = PageElement::Link(LinkRecord {
            href: "/cart".to_string(),
            attributes: Attributes::new(),
        });
        assert_eq!(link.to_string(), "link: href=/cart");
        let json = serde_json::to_value(&link).expect("serialize");
        assert_eq!(json["kind"], "link");
    }

    #[test]
    fn record_quantity_never_decreases() {
        let mut added = AddedProducts::default();
        let slot = added.push(ProductDetails {
            link: "https://shop.test/p1".to_string(),
            quantity_added: 2,
            ..ProductDetails::default()
        });
        added.record_quantity(slot, 1);
        assert_eq!(added.iter().next().map(|p| p.quantity_added), Some(2));
        added.record_quantity(slot, 3);
        assert_eq!(added.iter().next().map(|p| p.quantity_added), Some(3));
    }

    #[test]
    fn job_status_serializes_upper_case() {
        let json = serde_json::to_string(&JobStatus::Processed).expect("serialize");
        assert_eq!(json, "\"PROCESSED\"");
    }
}
