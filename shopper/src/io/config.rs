//! Agent configuration stored as TOML (default `shopper.toml`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Agent configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// agent was tuned with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Fixed RNG seed. When unset each job seeds from entropy.
    pub seed: Option<u64>,

    /// Upper bound on a single browser driver call, in seconds.
    pub action_timeout_secs: u64,

    /// Send prior turns of a session along with each oracle question.
    pub history: bool,

    /// Directory under which per-job artifact directories are created.
    pub artifacts_dir: PathBuf,

    pub synthesis: SynthesisConfig,
    pub discovery: DiscoveryConfig,
    pub product: ProductConfig,
    pub settle: SettleConfig,
    pub oracle: OracleConfig,
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Criterion drafts to try before accepting the last one.
    pub attempts: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self { attempts: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Navigations allowed per discovery run.
    pub hops: u32,
    /// Ask the oracle to pre-filter links when a page has more than this many.
    pub filter_threshold: usize,
    /// A filtered set this small is discarded in favor of the raw links.
    pub filter_floor: usize,
    /// Links classified per hop.
    pub working_set_cap: usize,
    /// Stop exploring once this many candidates are known.
    pub max_candidates: usize,
    /// Add contingency guidance when the worklist empties below this many candidates.
    pub contingency_threshold: usize,
    /// Consolidate when more than this many candidates were collected.
    pub consolidation_threshold: usize,
    /// Fewer candidates than this triggers the fallback driver.
    pub min_candidates: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hops: 5,
            filter_threshold: 10,
            filter_floor: 4,
            working_set_cap: 7,
            max_candidates: 10,
            contingency_threshold: 5,
            consolidation_threshold: 4,
            min_candidates: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProductConfig {
    pub overlay_attempts: usize,
    pub add_to_cart_tries: usize,
    /// Extra add rounds allowed when the criterion asks for more quantity.
    pub quantity_escalation_cap: u32,
    pub customization_retries: usize,
    /// Page text sent with detail extraction is truncated beyond this many bytes.
    pub page_text_limit_bytes: usize,
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            overlay_attempts: 2,
            add_to_cart_tries: 4,
            quantity_escalation_cap: 3,
            customization_retries: 2,
            page_text_limit_bytes: 20_000,
        }
    }
}

/// Settle delays in milliseconds. Zero disables a delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettleConfig {
    pub landing_ms: u64,
    pub navigation_ms: u64,
    pub action_ms: u64,
    pub observe_ms: u64,
    pub cart_ms: u64,
    pub apply_ms: u64,
    pub recycle_close_ms: u64,
    pub recycle_init_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            landing_ms: 20_000,
            navigation_ms: 4_000,
            action_ms: 4_000,
            observe_ms: 4_000,
            cart_ms: 8_000,
            apply_ms: 12_000,
            recycle_close_ms: 10_000,
            recycle_init_ms: 5_000,
        }
    }
}

impl SettleConfig {
    /// All delays zeroed, for tests and dry runs against fakes.
    pub fn none() -> Self {
        Self {
            landing_ms: 0,
            navigation_ms: 0,
            action_ms: 0,
            observe_ms: 0,
            cart_ms: 0,
            apply_ms: 0,
            recycle_close_ms: 0,
            recycle_init_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command spawned per question; receives the request as JSON on stdin.
    pub command: Vec<String>,
    pub shopping_model: String,
    pub verifier_model: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec!["shopper-oracle".to_string()],
            shopping_model: "gpt-4o".to_string(),
            verifier_model: "gpt-4o".to_string(),
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

/// Browser bridge commands. Both speak the JSON-lines driver protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    pub primary: Vec<String>,
    /// Driven through the async adapter; used for fallback discovery and the
    /// cart phases.
    pub fallback: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            primary: vec!["shopper-driver".to_string(), "--engine".to_string(), "selenium".to_string()],
            fallback: vec!["shopper-driver".to_string(), "--engine".to_string(), "playwright".to_string()],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            seed: None,
            action_timeout_secs: 90,
            history: false,
            artifacts_dir: PathBuf::from("jobs"),
            synthesis: SynthesisConfig::default(),
            discovery: DiscoveryConfig::default(),
            product: ProductConfig::default(),
            settle: SettleConfig::default(),
            oracle: OracleConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.action_timeout_secs == 0 {
            return Err(anyhow!("action_timeout_secs must be > 0"));
        }
        if self.synthesis.attempts == 0 {
            return Err(anyhow!("synthesis.attempts must be > 0"));
        }
        let discovery = &self.discovery;
        if discovery.hops == 0 {
            return Err(anyhow!("discovery.hops must be > 0"));
        }
        if discovery.working_set_cap == 0 || discovery.max_candidates == 0 {
            return Err(anyhow!(
                "discovery.working_set_cap and discovery.max_candidates must be > 0"
            ));
        }
        if discovery.filter_floor >= discovery.filter_threshold {
            return Err(anyhow!(
                "discovery.filter_floor must be below discovery.filter_threshold"
            ));
        }
        if self.product.add_to_cart_tries == 0 {
            return Err(anyhow!("product.add_to_cart_tries must be > 0"));
        }
        if self.product.customization_retries == 0 {
            return Err(anyhow!("product.customization_retries must be > 0"));
        }
        if self.product.page_text_limit_bytes == 0 {
            return Err(anyhow!("product.page_text_limit_bytes must be > 0"));
        }
        if self.oracle.timeout_secs == 0 || self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!(
                "oracle.timeout_secs and oracle.output_limit_bytes must be > 0"
            ));
        }
        for (name, command) in [
            ("oracle.command", &self.oracle.command),
            ("driver.primary", &self.driver.primary),
            ("driver.fallback", &self.driver.fallback),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("shopper.toml");
        let mut cfg = AgentConfig::default();
        cfg.seed = Some(11);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shopper.toml");
        fs::write(&path, "history = true\n\n[discovery]\nhops = 8\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(cfg.history);
        assert_eq!(cfg.discovery.hops, 8);
        assert_eq!(cfg.discovery.max_candidates, 10);
        assert_eq!(cfg.product, ProductConfig::default());
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let mut cfg = AgentConfig::default();
        cfg.discovery.hops = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.oracle.command = vec![" ".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("oracle.command"));
    }
}
