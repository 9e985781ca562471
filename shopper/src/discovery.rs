//! Bounded-hop link discovery over an unknown site.
//!
//! Starting from the seed URL, each hop enumerates the current page's links,
//! narrows them to a small working set, and asks the oracle to classify each
//! as a product to add (`ADD`) or a page to explore (`BROWSE`). Replies are
//! only trusted for URLs that were actually offered. The next page is drawn at
//! random from the worklist. A hop that learns nothing recycles the driver and
//! re-queues the stalled page once.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use minijinja::context;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::frontier::{Frontier, FrontierParts};
use crate::core::links::absolutize_all;
use crate::core::parse::{LinkVerdict, first_url, link_verdicts, matching_lines};
use crate::core::types::Criterion;
use crate::io::config::DiscoveryConfig;
use crate::io::driver::BrowserDriver;
use crate::io::prompt::Query;
use crate::workbench::Workbench;

/// Guidance appended to the classifier prompt once the worklist runs dry.
pub const CONTINGENCY_GUIDANCE: &str = "If no relevant product or page links are found, you must find BROWSE links that are likely to lead to the products you're looking for.";

/// Discovery failures the orchestrator branches on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("no links found on landing page {url}")]
    Unreachable { url: String },
}

/// Result of one discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Candidate product pages, consolidated when there were many.
    pub candidates: Vec<String>,
    /// Candidate -> page it was found on.
    pub sources: BTreeMap<String, String>,
    /// Pages still queued when the run stopped.
    pub leftover: Vec<String>,
    pub visited: BTreeSet<String>,
    /// Navigations performed, the initial one included.
    pub navigations: u32,
}

/// What the primary driver's run means for the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Success(Discovery),
    /// Rerun discovery with the fallback driver.
    Fallback { reason: String },
}

/// Run discovery and decide whether the fallback driver is needed.
pub fn discover_or_fallback<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    start: &str,
    criterion: &Criterion,
    cfg: &DiscoveryConfig,
) -> DiscoveryOutcome {
    match discover(bench, start, criterion, cfg) {
        Ok(found) if found.candidates.len() >= cfg.min_candidates => {
            DiscoveryOutcome::Success(found)
        }
        Ok(found) => DiscoveryOutcome::Fallback {
            reason: format!(
                "found {} candidate(s), need at least {}",
                found.candidates.len(),
                cfg.min_candidates
            ),
        },
        Err(err) => DiscoveryOutcome::Fallback {
            reason: format!("{err:#}"),
        },
    }
}

/// Explore from `start` and collect candidate product pages.
///
/// Initializes the driver first and closes it afterwards, also on error.
#[instrument(skip_all, fields(start = %start, hops = cfg.hops))]
pub fn discover<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    start: &str,
    criterion: &Criterion,
    cfg: &DiscoveryConfig,
) -> Result<Discovery> {
    let result = explore(bench, start, criterion, cfg);
    bench.close_quietly();
    let found = result?;
    info!(
        candidates = found.candidates.len(),
        visited = found.visited.len(),
        navigations = found.navigations,
        "discovery finished"
    );
    Ok(found)
}

fn explore<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    start: &str,
    criterion: &Criterion,
    cfg: &DiscoveryConfig,
) -> Result<Discovery> {
    bench.driver.initialize().context("initialize driver")?;
    bench.goto(start)?;
    let mut navigations = 1u32;

    let mut frontier = Frontier::new(start);
    let mut page_url = start.to_string();
    let mut guidance = String::new();
    let mut hops_left = cfg.hops;
    let mut hop = 0u32;
    let mut recycled = false;

    while hops_left > 0 {
        hop += 1;
        let links = match working_links(bench, cfg) {
            Ok(links) => links,
            Err(e) => {
                warn!(hop, err = %e, "could not collect links");
                Vec::new()
            }
        };
        debug!(hop, links = links.len(), page = %page_url, "hop started");
        if hop == 1 && links.is_empty() {
            return Err(DiscoveryError::Unreachable {
                url: start.to_string(),
            }
            .into());
        }

        let hits = if links.is_empty() {
            0
        } else {
            sift_links(bench, &mut frontier, hop, &page_url, &links, criterion, &guidance)?
        };
        if hits == 0 {
            debug!(hop, page = %page_url, "hop stalled, recycling driver");
            bench.recycle()?;
            recycled = true;
            frontier.requeue_stalled(&page_url);
        }

        match next_destination(bench, &mut frontier, &page_url, recycled)? {
            Some(next) => {
                frontier.mark_browsed(&next);
                bench.goto(&next)?;
                navigations += 1;
                hops_left -= 1;
                page_url = next;
                recycled = false;
                if frontier.candidate_count() >= cfg.max_candidates {
                    debug!(candidates = frontier.candidate_count(), "candidate cap reached");
                    break;
                }
            }
            None if frontier.candidate_count() < cfg.contingency_threshold
                && guidance.is_empty() =>
            {
                info!(hop, "worklist empty, adding contingency guidance");
                guidance = CONTINGENCY_GUIDANCE.to_string();
                if recycled {
                    bench.goto(&page_url)?;
                    navigations += 1;
                    hops_left -= 1;
                    recycled = false;
                }
            }
            None => break,
        }
    }

    let FrontierParts {
        candidates,
        sources,
        leftover,
        visited,
    } = frontier.into_parts();
    let candidates = consolidate(bench, candidates, cfg)?;
    Ok(Discovery {
        candidates,
        sources,
        leftover,
        visited,
        navigations,
    })
}

/// Links on the current page, narrowed and resolved to absolute URLs.
fn working_links<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    cfg: &DiscoveryConfig,
) -> Result<Vec<String>> {
    let raw: Vec<String> = bench
        .driver
        .links()
        .context("list links")?
        .into_iter()
        .map(|link| link.href)
        .collect();

    let mut working = if raw.len() > cfg.filter_threshold {
        let filtered: Vec<String> = bench
            .shopping
            .select(Query::FilterLinks, context! {}, &raw, &[])?
            .into_iter()
            .cloned()
            .collect();
        debug!(raw = raw.len(), filtered = filtered.len(), "filtered links");
        if filtered.len() <= cfg.filter_floor {
            raw.iter().take(cfg.filter_threshold).cloned().collect()
        } else if filtered.len() > cfg.filter_threshold {
            filtered
                .choose_multiple(&mut *bench.rng, cfg.filter_threshold)
                .cloned()
                .collect()
        } else {
            filtered
        }
    } else {
        raw
    };
    working.truncate(cfg.working_set_cap);

    let base = bench.current_url()?;
    Ok(absolutize_all(&base, &working))
}

/// Classify `links` and apply the verdicts to the frontier.
///
/// Returns the number of verdicts that changed the frontier. `ADD` verdicts
/// are ignored on the first hop and URLs that were not offered are dropped.
pub fn sift_links<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    frontier: &mut Frontier,
    hop: u32,
    page_url: &str,
    links: &[String],
    criterion: &Criterion,
    guidance: &str,
) -> Result<usize> {
    let reply = bench.shopping.ask(
        Query::SiftLinks,
        context! { links => links, criterion => criterion.as_str(), guidance => guidance },
        &[],
    )?;

    let mut hits = 0usize;
    for verdict in link_verdicts(&reply) {
        let url = match &verdict {
            LinkVerdict::Add(url) | LinkVerdict::Browse(url) => url,
        };
        if !links.iter().any(|offered| offered == url) {
            warn!(url = %url, "URL hallucination detected");
            continue;
        }
        let changed = match &verdict {
            LinkVerdict::Add(_) if hop == 1 => {
                debug!(url = %url, "ignoring ADD on landing page");
                false
            }
            LinkVerdict::Add(url) => frontier.offer_candidate(url, page_url),
            LinkVerdict::Browse(url) => frontier.offer_browse(url),
        };
        if changed {
            hits += 1;
        }
    }
    debug!(hop, hits, "links sifted");
    Ok(hits)
}

/// Pick the next page to visit, validated against the current one.
///
/// Picks whose repaired URL points at an already browsed page are dropped
/// without spending a hop. A page re-queued after a stall keeps its URL and
/// passes.
fn next_destination<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    frontier: &mut Frontier,
    page_url: &str,
    recycled: bool,
) -> Result<Option<String>> {
    while let Some(picked) = frontier.pick_next(&mut *bench.rng) {
        let current = if recycled {
            page_url.to_string()
        } else {
            bench.current_url()?
        };
        let next = checked_url(bench, &current, &picked)?;
        if next != picked && frontier.browsed().contains(&next) {
            warn!(picked = %picked, repaired = %next, "repaired url was already browsed, dropping pick");
            continue;
        }
        return Ok(Some(next));
    }
    Ok(None)
}

/// Validate the next URL against the current page, repairing it via the oracle if needed.
fn checked_url<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    current: &str,
    next: &str,
) -> Result<String> {
    if bench
        .shopping
        .yes_no(Query::IsUrlValid, context! { current => current, next => next }, &[])?
    {
        return Ok(next.to_string());
    }
    let reply = bench
        .shopping
        .ask(Query::RepairUrl, context! { current => current, next => next }, &[])?;
    match first_url(&reply) {
        Some(repaired) => {
            info!(from = %next, to = %repaired, "repaired next url");
            Ok(repaired)
        }
        None => {
            warn!(next = %next, reply = %reply, "url repair gave no url, keeping original");
            Ok(next.to_string())
        }
    }
}

fn consolidate<D: BrowserDriver>(
    bench: &mut Workbench<'_, '_, D>,
    candidates: Vec<String>,
    cfg: &DiscoveryConfig,
) -> Result<Vec<String>> {
    if candidates.len() <= cfg.consolidation_threshold {
        return Ok(candidates);
    }
    let reply = bench.shopping.ask(
        Query::ConsolidateCandidates,
        context! { links => &candidates },
        &[],
    )?;
    let kept: Vec<String> = matching_lines(&reply, &candidates)
        .into_iter()
        .cloned()
        .collect();
    if kept.is_empty() {
        warn!("consolidation kept nothing, using all candidates");
        return Ok(candidates);
    }
    debug!(before = candidates.len(), after = kept.len(), "candidates consolidated");
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePage, FakeSite, ScriptedOracle, SiteEvent, with_bench};

    const HOME: &str = "https://shop.test/";

    fn criterion() -> Criterion {
        Criterion::new("Product Categories: shoes")
    }

    fn cfg(hops: u32) -> DiscoveryConfig {
        DiscoveryConfig {
            hops,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn landing_add_is_ignored_and_browse_is_queued() {
        let links = vec![
            "https://shop.test/a".to_string(),
            "https://shop.test/b".to_string(),
            "https://shop.test/c".to_string(),
        ];
        let shopping = ScriptedOracle::new().reply(
            Query::SiftLinks,
            "ADD: https://shop.test/a\nBROWSE: https://shop.test/b",
        );
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new();
        let mut frontier = Frontier::new(HOME);

        let hits = with_bench(&mut site, &shopping, &verifier, |bench| {
            sift_links(bench, &mut frontier, 1, HOME, &links, &criterion(), "")
        })
        .expect("sift");

        assert_eq!(hits, 1);
        assert_eq!(frontier.to_browse(), ["https://shop.test/b"]);
        assert_eq!(frontier.candidate_count(), 0);
    }

    #[test]
    fn hallucinated_urls_change_nothing() {
        let links = vec!["https://shop.test/a".to_string()];
        let shopping = ScriptedOracle::new().reply(
            Query::SiftLinks,
            "ADD: https://shop.test/made-up\nBROWSE: https://elsewhere.test/",
        );
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new();
        let mut frontier = Frontier::new(HOME);
        let before = frontier.clone();

        let hits = with_bench(&mut site, &shopping, &verifier, |bench| {
            sift_links(bench, &mut frontier, 2, HOME, &links, &criterion(), "")
        })
        .expect("sift");

        assert_eq!(hits, 0);
        assert_eq!(frontier, before);
    }

    #[test]
    fn repeated_verdicts_count_once() {
        let links = vec!["https://shop.test/p1".to_string()];
        let shopping = ScriptedOracle::new().reply(
            Query::SiftLinks,
            "ADD: https://shop.test/p1\nADD: https://shop.test/p1",
        );
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new();
        let mut frontier = Frontier::new(HOME);

        let hits = with_bench(&mut site, &shopping, &verifier, |bench| {
            sift_links(bench, &mut frontier, 3, "https://shop.test/c", &links, &criterion(), "")
        })
        .expect("sift");

        assert_eq!(hits, 1);
        assert_eq!(frontier.candidates(), ["https://shop.test/p1"]);
        assert_eq!(
            frontier.sources().get("https://shop.test/p1").map(String::as_str),
            Some("https://shop.test/c")
        );
    }

    #[test]
    fn landing_page_without_links_is_unreachable() {
        let shopping = ScriptedOracle::new();
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(HOME, FakePage::new());

        let err = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(5))
        })
        .unwrap_err();

        assert_eq!(
            err.downcast_ref::<DiscoveryError>(),
            Some(&DiscoveryError::Unreachable {
                url: HOME.to_string()
            })
        );
        assert_eq!(site.events.last(), Some(&SiteEvent::Close));
    }

    #[test]
    fn two_hop_walk_collects_candidates() {
        let shopping = ScriptedOracle::new()
            .reply(Query::SiftLinks, "BROWSE: https://shop.test/shoes")
            .reply(
                Query::SiftLinks,
                "ADD: https://shop.test/p1\nADD: https://shop.test/p2\nBROWSE: https://shop.test/sale",
            )
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new()
            .page(HOME, FakePage::new().links(&["/shoes", "/about"]))
            .page(
                "https://shop.test/shoes",
                FakePage::new().links(&["/p1", "/p2", "/sale"]),
            );

        let found = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(2))
        })
        .expect("discover");

        assert_eq!(found.candidates, vec!["https://shop.test/p1", "https://shop.test/p2"]);
        assert_eq!(
            found.sources.get("https://shop.test/p2").map(String::as_str),
            Some("https://shop.test/shoes")
        );
        assert_eq!(found.navigations, 3);
        assert!(found.visited.contains("https://shop.test/sale"));
        assert!(found.leftover.is_empty());
        assert_eq!(
            site.navigations(),
            vec![HOME, "https://shop.test/shoes", "https://shop.test/sale"]
        );
    }

    #[test]
    fn hop_budget_bounds_navigation_when_oracle_is_useless() {
        let shopping = ScriptedOracle::new()
            .default_reply(Query::SiftLinks, "I am not sure")
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(HOME, FakePage::new().links(&["/a", "/b"]));

        let found = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(5))
        })
        .expect("discover");

        assert!(found.candidates.is_empty());
        assert!(found.navigations <= 1 + 5);
        // the stalled landing page is retried once, then guidance gets one more try
        assert_eq!(site.count(&SiteEvent::Navigate(HOME.to_string())), 3);
        assert_eq!(shopping.calls_for(Query::SiftLinks).len(), 3);
        let last_sift = shopping.calls_for(Query::SiftLinks).pop().expect("sift call");
        assert!(last_sift.prompt.contains(CONTINGENCY_GUIDANCE));
    }

    #[test]
    fn stalled_hop_recycles_driver_and_requeues_page() {
        let shopping = ScriptedOracle::new()
            .reply(Query::SiftLinks, "nothing useful")
            .reply(Query::SiftLinks, "BROWSE: https://shop.test/a")
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(HOME, FakePage::new().links(&["/a"]));

        let found = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(2))
        })
        .expect("discover");

        assert_eq!(site.count(&SiteEvent::Initialize), 2);
        assert_eq!(
            site.navigations(),
            vec![HOME, HOME, "https://shop.test/a"]
        );
        assert_eq!(found.navigations, 3);
        // validation used the stalled page, not the blank page left by the recycle
        let first_check = &shopping.calls_for(Query::IsUrlValid)[0];
        assert!(first_check.prompt.contains("Current URL is https://shop.test/."));
    }

    #[test]
    fn invalid_next_url_is_repaired() {
        let shopping = ScriptedOracle::new()
            .reply(Query::SiftLinks, "BROWSE: https://shop.test/x")
            .reply(Query::IsUrlValid, "No")
            .reply(Query::RepairUrl, "Sure:\nhttps://shop.test/x/fixed")
            .default_reply(Query::SiftLinks, "")
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(HOME, FakePage::new().links(&["/x"]));

        let found = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(1))
        })
        .expect("discover");

        assert!(found.visited.contains("https://shop.test/x/fixed"));
        assert_eq!(site.navigations(), vec![HOME, "https://shop.test/x/fixed"]);
    }

    #[test]
    fn repair_to_a_browsed_page_drops_the_pick() {
        let shopping = ScriptedOracle::new()
            .reply(Query::SiftLinks, "BROWSE: https://shop.test/x")
            .reply(Query::IsUrlValid, "No")
            .reply(Query::RepairUrl, "https://shop.test/")
            .default_reply(Query::SiftLinks, "")
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(HOME, FakePage::new().links(&["/x"]));

        let found = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(1))
        })
        .expect("discover");

        assert!(!found.visited.contains("https://shop.test/x"));
        assert_eq!(shopping.call_count(Query::RepairUrl), 1);
        // the only revisit of the landing page follows a stall recycle
        let revisit = site
            .events
            .iter()
            .rposition(|event| *event == SiteEvent::Navigate(HOME.to_string()))
            .expect("revisit");
        assert_eq!(site.navigations(), vec![HOME, HOME]);
        assert_eq!(site.events[revisit - 1], SiteEvent::Initialize);
    }

    #[test]
    fn many_links_are_filtered_then_capped() {
        let hrefs: Vec<String> = (0..12).map(|i| format!("/l{i}")).collect();
        let href_refs: Vec<&str> = hrefs.iter().map(String::as_str).collect();
        let shopping = ScriptedOracle::new()
            .reply(Query::FilterLinks, "1 2 3 4 5 6 7 8 9")
            .default_reply(Query::SiftLinks, "")
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(HOME, FakePage::new().links(&href_refs));

        with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(1))
        })
        .expect("discover");

        let sift = &shopping.calls_for(Query::SiftLinks)[0];
        assert!(sift.prompt.contains("https://shop.test/l6"));
        assert!(!sift.prompt.contains("https://shop.test/l7"));
    }

    #[test]
    fn sparse_filter_result_falls_back_to_raw_links() {
        let hrefs: Vec<String> = (0..12).map(|i| format!("/l{i}")).collect();
        let href_refs: Vec<&str> = hrefs.iter().map(String::as_str).collect();
        let shopping = ScriptedOracle::new()
            .reply(Query::FilterLinks, "12")
            .default_reply(Query::SiftLinks, "")
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new().page(HOME, FakePage::new().links(&href_refs));

        with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(1))
        })
        .expect("discover");

        let sift = &shopping.calls_for(Query::SiftLinks)[0];
        assert!(sift.prompt.contains("https://shop.test/l0\n"));
        assert!(!sift.prompt.contains("https://shop.test/l11"));
    }

    #[test]
    fn many_candidates_are_consolidated() {
        let shopping = ScriptedOracle::new()
            .reply(Query::SiftLinks, "BROWSE: https://shop.test/c")
            .reply(
                Query::SiftLinks,
                "ADD: https://shop.test/p1\nADD: https://shop.test/p2\nADD: https://shop.test/p3\nADD: https://shop.test/p4\nADD: https://shop.test/p5",
            )
            .reply(
                Query::ConsolidateCandidates,
                "https://shop.test/p2\nhttps://shop.test/invented\nhttps://shop.test/p5",
            )
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new()
            .page(HOME, FakePage::new().links(&["/c"]))
            .page(
                "https://shop.test/c",
                FakePage::new().links(&["/p1", "/p2", "/p3", "/p4", "/p5"]),
            );

        let found = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover(bench, HOME, &criterion(), &cfg(2))
        })
        .expect("discover");

        assert_eq!(found.candidates, vec!["https://shop.test/p2", "https://shop.test/p5"]);
        assert_eq!(found.sources.len(), 5);
    }

    #[test]
    fn thin_results_ask_for_fallback() {
        let shopping = ScriptedOracle::new()
            .reply(Query::SiftLinks, "BROWSE: https://shop.test/c")
            .reply(Query::SiftLinks, "ADD: https://shop.test/p1")
            .default_reply(Query::SiftLinks, "")
            .default_reply(Query::IsUrlValid, "Yes");
        let verifier = ScriptedOracle::new();
        let mut site = FakeSite::new()
            .page(HOME, FakePage::new().links(&["/c"]))
            .page("https://shop.test/c", FakePage::new().links(&["/p1"]));

        let outcome = with_bench(&mut site, &shopping, &verifier, |bench| {
            discover_or_fallback(bench, HOME, &criterion(), &cfg(2))
        });

        match outcome {
            DiscoveryOutcome::Fallback { reason } => assert!(reason.contains("found 1 candidate")),
            DiscoveryOutcome::Success(found) => panic!("unexpected success: {found:?}"),
        }
    }
}
