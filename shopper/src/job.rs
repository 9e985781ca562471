//! Job orchestration: criterion, discovery, products, cart and promo redemption.
//!
//! A job runs as one linear pipeline over two drivers. The primary driver
//! synthesizes the criterion and runs discovery; the secondary driver reruns
//! discovery when the primary falls short and performs every cart action.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument, warn};

use crate::checkout::{Scenario, attempt_applying_promo, navigate_to_cart_checkout};
use crate::core::links::format_seed_url;
use crate::core::parse::outcome_label;
use crate::core::types::{AddedProducts, Criterion, Job, JobOutcome, JobReport, JobStatus};
use crate::criterion::synthesize_criterion;
use crate::discovery::{Discovery, DiscoveryError, DiscoveryOutcome, discover, discover_or_fallback};
use crate::io::artifacts::JobDir;
use crate::io::config::AgentConfig;
use crate::io::driver::{BrowserDriver, Pacer};
use crate::io::oracle::{Oracle, OracleSession};
use crate::io::prompt::Query;
use crate::product::{ProductTask, process_product};
use crate::workbench::Workbench;

/// Verdict recorded when redemption did not get as far as pressing apply.
pub const EXECUTION_FAILED: &str = "Execution Failed";

/// Run `job` to completion and write its `outcome.json`.
///
/// Never fails: errors become a report with status `UNREACHABLE` (no links
/// reachable with either driver) or `FAILED`.
#[instrument(skip_all, fields(job_id = %job.id))]
pub fn run_job<P: BrowserDriver, S: BrowserDriver>(
    job: &Job,
    primary: &mut P,
    secondary: &mut S,
    shopping: &dyn Oracle,
    verifier: &dyn Oracle,
    config: &AgentConfig,
    base_dir: &Path,
) -> JobReport {
    let report = match JobDir::create(base_dir, &job.id) {
        Ok(dir) => {
            let result = execute_job(job, primary, secondary, shopping, verifier, config, &dir);
            let report = report_for(job, result);
            if let Err(e) = dir.write_outcome(&report) {
                warn!(err = format!("{e:#}"), "failed to write outcome record");
            }
            report
        }
        Err(err) => report_for(job, Err(err)),
    };

    for (name, closed) in [("primary", primary.close()), ("secondary", secondary.close())] {
        if let Err(e) = closed {
            warn!(driver = name, err = %e, "closing driver failed");
        }
    }
    info!(status = ?report.status, "job finished");
    report
}

fn report_for(job: &Job, result: Result<JobOutcome>) -> JobReport {
    match result {
        Ok(outcome) => JobReport {
            job_id: job.id.clone(),
            status: JobStatus::Processed,
            image: outcome.after_image.clone(),
            outcome: Some(outcome),
            error: None,
        },
        Err(err) => {
            let status = match err.downcast_ref::<DiscoveryError>() {
                Some(DiscoveryError::Unreachable { .. }) => JobStatus::Unreachable,
                None => JobStatus::Failed,
            };
            warn!(status = ?status, err = format!("{err:#}"), "job did not complete");
            JobReport {
                job_id: job.id.clone(),
                status,
                outcome: None,
                error: Some(format!("{err:#}")),
                image: None,
            }
        }
    }
}

fn execute_job<P: BrowserDriver, S: BrowserDriver>(
    job: &Job,
    primary: &mut P,
    secondary: &mut S,
    shopping_oracle: &dyn Oracle,
    verifier_oracle: &dyn Oracle,
    config: &AgentConfig,
    dir: &JobDir,
) -> Result<JobOutcome> {
    let seed_url = format_seed_url(&job.target_url);
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let pacer = Pacer::new(config.settle.clone());
    let mut shopping = OracleSession::new(
        shopping_oracle,
        "shopping",
        config.oracle.shopping_model.as_str(),
        config.history,
    );
    let mut verifier = OracleSession::new(
        verifier_oracle,
        "verifier",
        config.oracle.verifier_model.as_str(),
        config.history,
    );

    let (criterion, outcome) = {
        let mut bench = Workbench {
            driver: primary,
            shopping: &mut shopping,
            verifier: &mut verifier,
            pacer: &pacer,
            dir,
            rng: &mut rng,
        };
        bench
            .driver
            .initialize()
            .context("initialize primary driver")?;
        let synthesis = synthesize_criterion(
            &mut bench,
            &seed_url,
            job,
            &config.synthesis,
            config.product.page_text_limit_bytes,
        )?;
        bench.close_quietly();
        info!(drafts = synthesis.drafts, verified = synthesis.verified, "criterion ready");
        let outcome =
            discover_or_fallback(&mut bench, &seed_url, &synthesis.criterion, &config.discovery);
        (synthesis.criterion, outcome)
    };

    let mut bench = Workbench {
        driver: secondary,
        shopping: &mut shopping,
        verifier: &mut verifier,
        pacer: &pacer,
        dir,
        rng: &mut rng,
    };
    let discovery = match outcome {
        DiscoveryOutcome::Success(found) => found,
        DiscoveryOutcome::Fallback { reason } => {
            warn!(reason = %reason, "primary discovery fell short, using fallback driver");
            discover(&mut bench, &seed_url, &criterion, &config.discovery)?
        }
    };

    let added = add_products(&mut bench, &seed_url, &criterion, &discovery, config)?;

    let mut reached = navigate_to_cart_checkout(&mut bench, Scenario::Cart, Some(&seed_url))?;
    if !bench
        .shopping
        .yes_no(Query::HasPromoField, context! {}, &[&reached])?
    {
        info!("cart has no promo field, trying checkout");
        reached = navigate_to_cart_checkout(&mut bench, Scenario::Checkout, None)?;
    }

    let redemption = attempt_applying_promo(&mut bench, &job.promo_code, &reached)?;
    let (verdict_label, final_verdict_text) = match (&redemption.entry_image, &redemption.apply_image)
    {
        (Some(entry), Some(apply)) if redemption.applied => {
            let text = bench.verifier.ask(
                Query::FinalOutcome,
                context! { criterion => criterion.as_str() },
                &[entry, apply],
            )?;
            (outcome_label(&text), text)
        }
        _ => (None, EXECUTION_FAILED.to_string()),
    };
    info!(
        applied = redemption.applied,
        label = ?verdict_label,
        products = added.len(),
        "redemption finished"
    );

    Ok(JobOutcome {
        promo_applied: redemption.applied,
        criterion,
        added_products: added,
        verdict_label,
        final_verdict_text,
        before_image: redemption.entry_image,
        after_image: redemption.apply_image,
    })
}

/// Visit candidates in random order until the verifier judges the criterion met.
fn add_products<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    seed_url: &str,
    criterion: &Criterion,
    discovery: &Discovery,
    config: &AgentConfig,
) -> Result<AddedProducts> {
    bench.driver.initialize().context("initialize driver")?;
    bench.goto(seed_url)?;
    bench.pacer.landing();
    bench.snapshot("products_landing")?;

    let mut pending = discovery.candidates.clone();
    let mut added = AddedProducts::default();
    let mut index = 0usize;
    while !pending.is_empty() {
        let link = pending.swap_remove(bench.rng.gen_range(0..pending.len()));
        let task = ProductTask {
            index,
            link: &link,
            source: discovery.sources.get(&link).map(String::as_str),
            clear_overlay: index == 0,
        };
        index += 1;
        match process_product(bench, criterion, &config.product, &task, &mut added) {
            Ok(report) => debug!(link = %link, verdict = ?report.verdict, "product processed"),
            Err(e) => {
                warn!(link = %link, err = format!("{e:#}"), "product skipped");
                continue;
            }
        }
        if added.is_empty() {
            continue;
        }

        let (met, reason) = bench.shopping.yes_no_explained(
            Query::CriteriaMet,
            context! { criterion => criterion.as_str(), added => added.summary() },
            &[],
        )?;
        if met {
            info!(products = added.len(), "criterion met");
            break;
        }
        debug!(reason = %reason, "criterion not met yet");
    }
    if pending.is_empty() && added.is_empty() {
        warn!(candidates = discovery.candidates.len(), "no product was added");
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::test_support::{FakePage, FakeSite, ScriptedOracle, with_bench};

    const HOME: &str = "https://shop.test/";

    fn discovery(links: &[&str]) -> Discovery {
        Discovery {
            candidates: links.iter().map(|link| link.to_string()).collect(),
            sources: links
                .iter()
                .map(|link| (link.to_string(), HOME.to_string()))
                .collect::<BTreeMap<_, _>>(),
            leftover: Vec::new(),
            visited: BTreeSet::new(),
            navigations: 1,
        }
    }

    fn shop() -> FakeSite {
        let product = || FakePage::new().buttons(&["Add to cart"]);
        FakeSite::new()
            .page(HOME, FakePage::new())
            .page("https://shop.test/p1", product())
            .page("https://shop.test/p2", product())
            .page("https://shop.test/p3", product())
    }

    fn shopping() -> ScriptedOracle {
        ScriptedOracle::new()
            .default_reply(Query::HasOverlay, "No")
            .default_reply(Query::ProductDetails, "productName : Runner")
            .default_reply(Query::ProductOptions, "None")
            .default_reply(Query::AddToCartButtons, "1")
            .default_reply(Query::IsProductAdded, "Yes")
            .default_reply(Query::NeedsMoreQuantity, "No")
    }

    #[test]
    fn stops_once_criterion_is_met() {
        let shopping = shopping().reply(Query::CriteriaMet, "Yes, one pair is enough");
        let verifier = ScriptedOracle::new().default_reply(Query::IsApplicable, "Yes");
        let mut site = shop();
        let found = discovery(&["https://shop.test/p1", "https://shop.test/p2", "https://shop.test/p3"]);

        let added = with_bench(&mut site, &shopping, &verifier, |bench| {
            add_products(bench, HOME, &Criterion::new("shoes"), &found, &crate::test_support::fast_config())
        })
        .expect("add products");

        assert_eq!(added.len(), 1);
        assert_eq!(shopping.call_count(Query::CriteriaMet), 1);
        assert_eq!(verifier.call_count(Query::CriteriaMet), 0);
        assert_eq!(verifier.call_count(Query::IsApplicable), 1);
        let source = added.iter().next().and_then(|p| p.source.clone());
        assert_eq!(source.as_deref(), Some(HOME));
    }

    #[test]
    fn criterion_check_waits_for_an_added_product() {
        let shopping = shopping().default_reply(Query::CriteriaMet, "No");
        let verifier = ScriptedOracle::new().replies(Query::IsApplicable, &["No", "No", "Yes"]);
        let mut site = shop();
        let found = discovery(&["https://shop.test/p1", "https://shop.test/p2", "https://shop.test/p3"]);

        let added = with_bench(&mut site, &shopping, &verifier, |bench| {
            add_products(bench, HOME, &Criterion::new("shoes"), &found, &crate::test_support::fast_config())
        })
        .expect("add products");

        assert_eq!(added.len(), 1);
        assert_eq!(shopping.call_count(Query::CriteriaMet), 1);
        // overlay check only on the first product
        assert_eq!(shopping.call_count(Query::HasOverlay), 1);
    }

    #[test]
    fn every_candidate_is_visited_once() {
        let shopping = shopping().default_reply(Query::CriteriaMet, "No");
        let verifier = ScriptedOracle::new().default_reply(Query::IsApplicable, "Yes");
        let mut site = shop();
        let found = discovery(&["https://shop.test/p1", "https://shop.test/p2", "https://shop.test/p3"]);

        let added = with_bench(&mut site, &shopping, &verifier, |bench| {
            add_products(bench, HOME, &Criterion::new("shoes"), &found, &crate::test_support::fast_config())
        })
        .expect("add products");

        assert_eq!(added.len(), 3);
        let mut visited: Vec<&str> = site
            .navigations()
            .into_iter()
            .filter(|url| url.contains("/p"))
            .collect();
        visited.sort_unstable();
        assert_eq!(
            visited,
            vec!["https://shop.test/p1", "https://shop.test/p2", "https://shop.test/p3"]
        );
    }

    #[test]
    fn failing_product_is_skipped() {
        // only one options reply is scripted, so the second product errors
        let shopping = ScriptedOracle::new()
            .default_reply(Query::HasOverlay, "No")
            .default_reply(Query::ProductDetails, "productName : Runner")
            .reply(Query::ProductOptions, "None")
            .default_reply(Query::AddToCartButtons, "1")
            .default_reply(Query::IsProductAdded, "Yes")
            .default_reply(Query::NeedsMoreQuantity, "No")
            .default_reply(Query::CriteriaMet, "No");
        let verifier = ScriptedOracle::new().default_reply(Query::IsApplicable, "Yes");
        let mut site = shop();
        let found = discovery(&["https://shop.test/p1", "https://shop.test/p2"]);

        let added = with_bench(&mut site, &shopping, &verifier, |bench| {
            add_products(bench, HOME, &Criterion::new("shoes"), &found, &crate::test_support::fast_config())
        })
        .expect("add products");

        assert_eq!(added.len(), 1);
        assert_eq!(shopping.call_count(Query::ProductOptions), 2);
        assert_eq!(shopping.call_count(Query::CriteriaMet), 1);
    }

    #[test]
    fn unreachable_discovery_maps_to_status() {
        let job = Job {
            id: "j".to_string(),
            target_url: "shop.test".to_string(),
            promo_description: "10% off".to_string(),
            promo_code: "TEN".to_string(),
        };
        let err = anyhow::Error::from(DiscoveryError::Unreachable {
            url: HOME.to_string(),
        })
        .context("fallback discovery");

        let report = report_for(&job, Err(err));

        assert_eq!(report.status, JobStatus::Unreachable);
        assert!(report.error.expect("error").contains("fallback discovery"));
    }
}
