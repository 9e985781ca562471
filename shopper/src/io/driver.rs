//! Browser driver abstraction.
//!
//! The agent phases are written once against the blocking [`BrowserDriver`]
//! trait. Suspension-based drivers implement [`AsyncBrowserDriver`] and are
//! plugged in through [`AsyncAdapter`], which drives each call to completion
//! on its own runtime and bounds it with a timeout.

use std::future::Future;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::core::types::{Control, LinkRecord};
use crate::io::config::SettleConfig;

/// How a click resolves its target when several elements match the control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickMode {
    /// The control must identify exactly one element.
    Single,
    /// Click the first matching element.
    First,
}

/// Blocking browser automation used by every agent phase.
pub trait BrowserDriver {
    /// Start (or restart) a browser session on a blank page.
    fn initialize(&mut self) -> Result<()>;
    fn navigate(&mut self, url: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    fn screenshot(&mut self, path: &Path) -> Result<()>;
    fn current_url(&mut self) -> Result<String>;
    fn body_text(&mut self) -> Result<String>;
    fn buttons(&mut self) -> Result<Vec<Control>>;
    fn links(&mut self) -> Result<Vec<LinkRecord>>;
    fn text_fields(&mut self) -> Result<Vec<Control>>;

    fn click(&mut self, control: &Control, mode: ClickMode) -> Result<()>;
    fn type_text(&mut self, control: &Control, text: &str) -> Result<()>;
}

/// Suspension-based browser automation.
#[async_trait]
pub trait AsyncBrowserDriver: Send {
    async fn initialize(&mut self) -> Result<()>;
    async fn navigate(&mut self, url: &str) -> Result<()>;
    async fn close(&mut self) -> Result<()>;

    async fn screenshot(&mut self, path: &Path) -> Result<()>;
    async fn current_url(&mut self) -> Result<String>;
    async fn body_text(&mut self) -> Result<String>;
    async fn buttons(&mut self) -> Result<Vec<Control>>;
    async fn links(&mut self) -> Result<Vec<LinkRecord>>;
    async fn text_fields(&mut self) -> Result<Vec<Control>>;

    async fn click(&mut self, control: &Control, mode: ClickMode) -> Result<()>;
    async fn type_text(&mut self, control: &Control, text: &str) -> Result<()>;
}

/// Presents an [`AsyncBrowserDriver`] as a [`BrowserDriver`].
pub struct AsyncAdapter<D> {
    inner: D,
    runtime: Runtime,
    timeout: Duration,
}

impl<D: AsyncBrowserDriver> AsyncAdapter<D> {
    pub fn new(inner: D, timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build driver runtime")?;
        Ok(Self {
            inner,
            runtime,
            timeout,
        })
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

fn drive<T>(
    runtime: &Runtime,
    timeout: Duration,
    op: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match runtime.block_on(async { tokio::time::timeout(timeout, call).await }) {
        Ok(result) => result.with_context(|| format!("driver {op}")),
        Err(_) => Err(anyhow!("driver {op} timed out after {timeout:?}")),
    }
}

impl<D: AsyncBrowserDriver> BrowserDriver for AsyncAdapter<D> {
    fn initialize(&mut self) -> Result<()> {
        drive(&self.runtime, self.timeout, "initialize", self.inner.initialize())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        drive(&self.runtime, self.timeout, "navigate", self.inner.navigate(url))
    }

    fn close(&mut self) -> Result<()> {
        drive(&self.runtime, self.timeout, "close", self.inner.close())
    }

    fn screenshot(&mut self, path: &Path) -> Result<()> {
        drive(&self.runtime, self.timeout, "screenshot", self.inner.screenshot(path))
    }

    fn current_url(&mut self) -> Result<String> {
        drive(&self.runtime, self.timeout, "current_url", self.inner.current_url())
    }

    fn body_text(&mut self) -> Result<String> {
        drive(&self.runtime, self.timeout, "body_text", self.inner.body_text())
    }

    fn buttons(&mut self) -> Result<Vec<Control>> {
        drive(&self.runtime, self.timeout, "buttons", self.inner.buttons())
    }

    fn links(&mut self) -> Result<Vec<LinkRecord>> {
        drive(&self.runtime, self.timeout, "links", self.inner.links())
    }

    fn text_fields(&mut self) -> Result<Vec<Control>> {
        drive(&self.runtime, self.timeout, "text_fields", self.inner.text_fields())
    }

    fn click(&mut self, control: &Control, mode: ClickMode) -> Result<()> {
        drive(&self.runtime, self.timeout, "click", self.inner.click(control, mode))
    }

    fn type_text(&mut self, control: &Control, text: &str) -> Result<()> {
        drive(
            &self.runtime,
            self.timeout,
            "type_text",
            self.inner.type_text(control, text),
        )
    }
}

/// Fixed settle delays between browser actions.
#[derive(Debug, Clone)]
pub struct Pacer {
    settle: SettleConfig,
}

impl Pacer {
    pub fn new(settle: SettleConfig) -> Self {
        Self { settle }
    }

    /// Wait after loading the seed page.
    pub fn landing(&self) {
        pause("landing", self.settle.landing_ms);
    }

    pub fn navigation(&self) {
        pause("navigation", self.settle.navigation_ms);
    }

    /// Wait after a click or text entry.
    pub fn action(&self) {
        pause("action", self.settle.action_ms);
    }

    /// Wait before a screenshot is taken for the oracle.
    pub fn observe(&self) {
        pause("observe", self.settle.observe_ms);
    }

    pub fn cart(&self) {
        pause("cart", self.settle.cart_ms);
    }

    pub fn apply(&self) {
        pause("apply", self.settle.apply_ms);
    }

    pub fn recycle_close(&self) {
        pause("recycle_close", self.settle.recycle_close_ms);
    }

    pub fn recycle_init(&self) {
        pause("recycle_init", self.settle.recycle_init_ms);
    }
}

fn pause(kind: &str, millis: u64) {
    if millis == 0 {
        return;
    }
    debug!(kind, millis, "settling");
    thread::sleep(Duration::from_millis(millis));
}
