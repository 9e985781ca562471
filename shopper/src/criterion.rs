//! Criterion synthesis: turn a free-form promo description into structured
//! eligibility rules, refined by a verifier until it accepts or the attempt
//! budget runs out.

use anyhow::Result;
use minijinja::context;
use tracing::{debug, info, instrument, warn};

use crate::core::parse::verifier_rejects;
use crate::core::types::{Criterion, Job};
use crate::io::config::SynthesisConfig;
use crate::io::driver::BrowserDriver;
use crate::io::prompt::{Query, truncate_to_budget};
use crate::workbench::Workbench;

/// Accepted criterion with the verifier's last word on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub criterion: Criterion,
    pub verifier_reply: String,
    pub drafts: u32,
    /// False when the budget ran out and the last draft was taken as-is.
    pub verified: bool,
}

/// Generate and verify a criterion for `job` from its landing page.
///
/// The driver must already be initialized. Rejections feed back into the next
/// draft; when every draft is rejected the last one is accepted.
#[instrument(skip_all, fields(job_id = %job.id, attempts = cfg.attempts))]
pub fn synthesize_criterion<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    landing_url: &str,
    job: &Job,
    cfg: &SynthesisConfig,
    page_text_limit: usize,
) -> Result<Synthesis> {
    bench.goto(landing_url)?;
    bench.pacer.landing();
    let image = bench.snapshot("criterion_landing")?;
    let page_text = match bench.driver.body_text() {
        Ok(text) => truncate_to_budget(&text, page_text_limit),
        Err(e) => {
            warn!(err = %e, "landing page text unavailable");
            String::new()
        }
    };

    let mut feedback = String::new();
    let mut last = None;
    for draft in 1..=cfg.attempts {
        let text = bench.shopping.ask(
            Query::GenerateCriterion,
            context! {
                description => &job.promo_description,
                promo_code => &job.promo_code,
                page_text => &page_text,
                feedback => &feedback,
            },
            &[&image],
        )?;
        let verdict = bench.verifier.ask(
            Query::VerifyCriterion,
            context! { description => &job.promo_description, criterion => &text },
            &[],
        )?;
        let criterion = Criterion::new(text);
        if !verifier_rejects(&verdict) {
            info!(draft, "criterion accepted");
            return Ok(Synthesis {
                criterion,
                verifier_reply: verdict,
                drafts: draft,
                verified: true,
            });
        }
        debug!(draft, verdict = %verdict, "criterion draft rejected");
        feedback.push_str(verdict.trim());
        feedback.push('\n');
        last = Some((criterion, verdict));
    }

    let (criterion, verifier_reply) =
        last.unwrap_or_else(|| (Criterion::new(job.promo_description.clone()), String::new()));
    warn!(drafts = cfg.attempts, "no criterion draft verified, keeping the last one");
    Ok(Synthesis {
        criterion,
        verifier_reply,
        drafts: cfg.attempts,
        verified: false,
    })
}
