//! Decision oracle abstraction.
//!
//! The [`Oracle`] trait decouples the agent phases from the reasoning backend.
//! [`CommandOracle`] spawns a configured command per question; tests use the
//! scripted oracle from `test_support`, which answers from per-query queues.
//!
//! Every question goes through an [`OracleSession`], which renders the prompt,
//! attaches the answer-format instruction and records the exchange as a
//! [`Turn`]. Sessions with history enabled send the prior turns along.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use minijinja::Value;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::parse::{indexed_list, indexed_selection, is_yes};
use crate::io::config::OracleConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::{self, Query};

const YES_NO: &str = "Respond with either 'Yes' or 'No'.";
const YES_NO_EXPLAINED: &str =
    "Respond with either 'Yes' or 'No' before explaining in one line why yes or why not.";
const SELECT: &str = "Respond with button serial numbers with a single space between each number, in case of None, reply with -1. Try to select at least 1.";

/// One question put to the oracle.
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest<'a> {
    pub query: Query,
    /// Session name (`shopping` or `verifier`).
    pub session: String,
    pub model: String,
    pub prompt: String,
    pub instructions: String,
    pub images: Vec<PathBuf>,
    /// Prior turns of the session, borrowed from it; empty unless history is enabled.
    pub history: &'a [Turn],
}

/// A completed question/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub query: Query,
    pub prompt: String,
    pub images: Vec<PathBuf>,
    pub reply: String,
}

/// Abstraction over decision oracle backends.
pub trait Oracle {
    /// Answer `request` with free text.
    fn ask(&self, request: &OracleRequest<'_>) -> Result<String>;
}

/// Conversation state for one role (shopping or verification) within a job.
pub struct OracleSession<'o> {
    oracle: &'o dyn Oracle,
    name: String,
    model: String,
    history: bool,
    turns: Vec<Turn>,
}

impl<'o> OracleSession<'o> {
    pub fn new(
        oracle: &'o dyn Oracle,
        name: impl Into<String>,
        model: impl Into<String>,
        history: bool,
    ) -> Self {
        Self {
            oracle,
            name: name.into(),
            model: model.into(),
            history,
            turns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Free-text question using the query's own answer format.
    pub fn ask(&mut self, query: Query, ctx: Value, images: &[&Path]) -> Result<String> {
        let prompt = prompt::render(query, ctx)?;
        self.exchange(query, prompt, query.instructions(), images)
    }

    pub fn yes_no(&mut self, query: Query, ctx: Value, images: &[&Path]) -> Result<bool> {
        let prompt = prompt::render(query, ctx)?;
        let reply = self.exchange(query, prompt, YES_NO, images)?;
        Ok(is_yes(&reply))
    }

    /// Yes/no question whose reply also carries a one-line rationale.
    pub fn yes_no_explained(
        &mut self,
        query: Query,
        ctx: Value,
        images: &[&Path],
    ) -> Result<(bool, String)> {
        let prompt = prompt::render(query, ctx)?;
        let reply = self.exchange(query, prompt, YES_NO_EXPLAINED, images)?;
        Ok((is_yes(&reply), reply))
    }

    /// Ask the oracle to pick from `items`, shown as a numbered list.
    ///
    /// Returns the picked items in reply order. Out-of-range, repeated and
    /// non-numeric picks are dropped; `-1` yields an empty selection.
    pub fn select<'a, T: Display>(
        &mut self,
        query: Query,
        ctx: Value,
        items: &'a [T],
        images: &[&Path],
    ) -> Result<Vec<&'a T>> {
        if items.is_empty() {
            debug!(query = query.name(), "nothing to select from");
            return Ok(Vec::new());
        }
        let rendered = prompt::render(query, ctx)?;
        let prompt = format!("{rendered}\n{}", indexed_list(items));
        let reply = self.exchange(query, prompt, SELECT, images)?;
        let picked: Vec<&T> = indexed_selection(&reply, items.len())
            .into_iter()
            .map(|index| &items[index])
            .collect();
        debug!(query = query.name(), offered = items.len(), picked = picked.len(), "selection parsed");
        Ok(picked)
    }

    #[instrument(skip_all, fields(session = %self.name, query = query.name()))]
    fn exchange(
        &mut self,
        query: Query,
        prompt: String,
        instructions: &str,
        images: &[&Path],
    ) -> Result<String> {
        let images: Vec<PathBuf> = images.iter().map(|path| path.to_path_buf()).collect();
        let request = OracleRequest {
            query,
            session: self.name.clone(),
            model: self.model.clone(),
            prompt,
            instructions: instructions.to_string(),
            images,
            history: if self.history { &self.turns } else { &[] },
        };
        let reply = self
            .oracle
            .ask(&request)
            .with_context(|| format!("oracle query {}", query.name()))?;
        let reply = reply.trim().to_string();
        debug!(reply_len = reply.len(), "oracle replied");
        let OracleRequest { prompt, images, .. } = request;
        self.turns.push(Turn {
            query,
            prompt,
            images,
            reply: reply.clone(),
        });
        Ok(reply)
    }
}

/// Oracle that spawns a command per question.
///
/// The request is written to the command's stdin as JSON and its stdout is
/// taken as the answer.
pub struct CommandOracle {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &OracleConfig) -> Self {
        Self::new(
            cfg.command.clone(),
            Duration::from_secs(cfg.timeout_secs),
            cfg.output_limit_bytes,
        )
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(query = request.query.name(), timeout_secs = self.timeout.as_secs()))]
    fn ask(&self, request: &OracleRequest<'_>) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let payload = serde_json::to_vec(request).context("serialize oracle request")?;
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run oracle command")?;

        if output.timed_out {
            warn!("oracle command timed out");
            bail!("oracle command timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "oracle command failed");
            bail!(
                "oracle command failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;
    use std::cell::RefCell;

    struct Seen {
        prompt: String,
        instructions: String,
        history: Vec<Turn>,
    }

    struct CannedOracle {
        replies: RefCell<Vec<String>>,
        seen: RefCell<Vec<Seen>>,
    }

    impl CannedOracle {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: RefCell::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Oracle for CannedOracle {
        fn ask(&self, request: &OracleRequest<'_>) -> Result<String> {
            self.seen.borrow_mut().push(Seen {
                prompt: request.prompt.clone(),
                instructions: request.instructions.clone(),
                history: request.history.to_vec(),
            });
            self.replies
                .borrow_mut()
                .pop()
                .ok_or_else(|| anyhow!("no reply left"))
        }
    }

    #[test]
    fn yes_no_uses_fixed_instruction() {
        let oracle = CannedOracle::new(&["Yes, there is a cookie banner"]);
        let mut session = OracleSession::new(&oracle, "shopping", "m", false);
        assert!(session
            .yes_no(Query::HasOverlay, context! {}, &[])
            .expect("ask"));
        let seen = oracle.seen.borrow();
        assert_eq!(seen[0].instructions, YES_NO);
        assert_eq!(session.turns().len(), 1);
    }

    #[test]
    fn select_maps_indices_back_to_items() {
        let oracle = CannedOracle::new(&["3 1 9 1"]);
        let mut session = OracleSession::new(&oracle, "shopping", "m", false);
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let picked = session
            .select(Query::FilterLinks, context! {}, &items, &[])
            .expect("select");
        assert_eq!(picked, vec![&items[2], &items[0]]);
        let seen = oracle.seen.borrow();
        assert!(seen[0].prompt.ends_with("1. a\n2. b\n3. c"));
        assert_eq!(seen[0].instructions, SELECT);
    }

    #[test]
    fn select_skips_oracle_when_nothing_offered() {
        let oracle = CannedOracle::new(&[]);
        let mut session = OracleSession::new(&oracle, "shopping", "m", false);
        let items: Vec<String> = Vec::new();
        let picked = session
            .select(Query::PromoFields, context! {}, &items, &[])
            .expect("select");
        assert!(picked.is_empty());
        assert!(oracle.seen.borrow().is_empty());
    }

    #[test]
    fn history_mode_sends_prior_turns() {
        let oracle = CannedOracle::new(&["No", "Yes"]);
        let mut session = OracleSession::new(&oracle, "verifier", "m", true);
        session
            .yes_no(Query::IsProductAdded, context! {}, &[])
            .expect("first");
        session
            .yes_no(Query::IsProductAdded, context! {}, &[])
            .expect("second");
        let seen = oracle.seen.borrow();
        assert!(seen[0].history.is_empty());
        assert_eq!(seen[1].history.len(), 1);
        assert_eq!(seen[1].history[0].reply, "No");
    }

    #[test]
    fn oracle_errors_carry_query_context() {
        let oracle = CannedOracle::new(&[]);
        let mut session = OracleSession::new(&oracle, "shopping", "m", false);
        let err = session
            .ask(Query::RepairUrl, context! {}, &[])
            .unwrap_err();
        assert!(format!("{err:#}").contains("oracle query repair_url"));
        assert!(session.turns().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_passes_request_on_stdin() {
        let oracle = CommandOracle::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"grep -o '"query":"[a-z_]*"'"#.to_string(),
            ],
            Duration::from_secs(10),
            10_000,
        );
        let mut session = OracleSession::new(&oracle, "shopping", "m", false);
        let reply = session
            .ask(Query::RepairUrl, context! { current => "a", next => "b" }, &[])
            .expect("ask");
        assert_eq!(reply, r#""query":"repair_url""#);
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_reports_failure_status() {
        let oracle = CommandOracle::new(
            vec!["sh".to_string(), "-c".to_string(), "cat >/dev/null; echo boom >&2; exit 4".to_string()],
            Duration::from_secs(10),
            10_000,
        );
        let mut session = OracleSession::new(&oracle, "shopping", "m", false);
        let err = session
            .ask(Query::RepairUrl, context! {}, &[])
            .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_receives_session_history() {
        // answers with the number of request lines mentioning a prior reply
        let oracle = CommandOracle::new(
            vec!["sh".to_string(), "-c".to_string(), r#"grep -c '"reply"' || true"#.to_string()],
            Duration::from_secs(10),
            10_000,
        );
        let mut session = OracleSession::new(&oracle, "verifier", "m", true);
        let first = session.ask(Query::RepairUrl, context! {}, &[]).expect("first");
        let second = session.ask(Query::RepairUrl, context! {}, &[]).expect("second");
        assert_eq!(first, "0");
        assert_eq!(second, "1");
        assert_eq!(session.turns().len(), 2);
    }
}
