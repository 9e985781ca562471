//! Test-only fakes: a scripted oracle and an in-memory site driver.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::core::types::{Attributes, Control, LinkRecord};
use crate::io::artifacts::JobDir;
use crate::io::config::{AgentConfig, SettleConfig};
use crate::io::driver::{AsyncBrowserDriver, BrowserDriver, ClickMode, Pacer};
use crate::io::oracle::{Oracle, OracleRequest, OracleSession};
use crate::io::prompt::Query;
use crate::workbench::Workbench;

type Responder = Box<dyn Fn(&OracleRequest<'_>) -> String>;

/// Owned copy of a question the scripted oracle was asked.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub query: Query,
    pub session: String,
    pub prompt: String,
    pub instructions: String,
    pub images: Vec<PathBuf>,
    pub history_len: usize,
}

impl From<&OracleRequest<'_>> for RecordedCall {
    fn from(request: &OracleRequest<'_>) -> Self {
        Self {
            query: request.query,
            session: request.session.clone(),
            prompt: request.prompt.clone(),
            instructions: request.instructions.clone(),
            images: request.images.clone(),
            history_len: request.history.len(),
        }
    }
}

/// Oracle answering from per-query reply queues.
///
/// A query is answered by the next queued reply, else by its responder, else
/// by its default reply. A query with none of these fails, so tests notice
/// questions they did not expect.
#[derive(Default)]
pub struct ScriptedOracle {
    queues: RefCell<BTreeMap<Query, VecDeque<String>>>,
    responders: BTreeMap<Query, Responder>,
    defaults: BTreeMap<Query, String>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply for `query`.
    pub fn reply(self, query: Query, text: &str) -> Self {
        self.queues
            .borrow_mut()
            .entry(query)
            .or_default()
            .push_back(text.to_string());
        self
    }

    pub fn replies(mut self, query: Query, texts: &[&str]) -> Self {
        for text in texts {
            self = self.reply(query, text);
        }
        self
    }

    /// Reply used once the queue for `query` is drained.
    pub fn default_reply(mut self, query: Query, text: &str) -> Self {
        self.defaults.insert(query, text.to_string());
        self
    }

    pub fn respond_with(
        mut self,
        query: Query,
        responder: impl Fn(&OracleRequest<'_>) -> String + 'static,
    ) -> Self {
        self.responders.insert(query, Box::new(responder));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn calls_for(&self, query: Query) -> Vec<RecordedCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.query == query)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, query: Query) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.query == query)
            .count()
    }
}

impl Oracle for ScriptedOracle {
    fn ask(&self, request: &OracleRequest<'_>) -> Result<String> {
        self.calls.borrow_mut().push(RecordedCall::from(request));
        let queued = self
            .queues
            .borrow_mut()
            .get_mut(&request.query)
            .and_then(VecDeque::pop_front);
        if let Some(reply) = queued {
            return Ok(reply);
        }
        if let Some(responder) = self.responders.get(&request.query) {
            return Ok(responder(request));
        }
        self.defaults
            .get(&request.query)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted reply for {}", request.query.name()))
    }
}

/// Contents of one fake page.
#[derive(Debug, Clone, Default)]
pub struct FakePage {
    pub links: Vec<LinkRecord>,
    pub buttons: Vec<Control>,
    pub text_fields: Vec<Control>,
    pub body: String,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links(mut self, hrefs: &[&str]) -> Self {
        self.links.extend(hrefs.iter().map(|href| link(href)));
        self
    }

    pub fn buttons(mut self, texts: &[&str]) -> Self {
        self.buttons.extend(texts.iter().map(|text| button(text)));
        self
    }

    pub fn text_fields(mut self, names: &[&str]) -> Self {
        self.text_fields
            .extend(names.iter().map(|name| text_field(name)));
        self
    }

    pub fn body(mut self, text: &str) -> Self {
        self.body = text.to_string();
        self
    }
}

/// Observable driver calls, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteEvent {
    Initialize,
    Navigate(String),
    Click(String),
    Type { field: String, text: String },
    Screenshot(PathBuf),
    Close,
}

/// In-memory site keyed by URL.
///
/// Clicks are resolved by the control's `text` attribute (or `name` for text
/// fields). Screenshots write empty files so tests can check artifacts.
#[derive(Debug, Clone, Default)]
pub struct FakeSite {
    pages: BTreeMap<String, FakePage>,
    click_targets: BTreeMap<String, String>,
    failing_clicks: BTreeSet<String>,
    current: Option<String>,
    pub events: Vec<SiteEvent>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, page: FakePage) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    /// Clicking the button labelled `text` navigates to `url`.
    pub fn on_click(mut self, text: &str, url: &str) -> Self {
        self.click_targets.insert(text.to_string(), url.to_string());
        self
    }

    /// Clicking the button labelled `text` fails in the driver.
    pub fn failing_click(mut self, text: &str) -> Self {
        self.failing_clicks.insert(text.to_string());
        self
    }

    pub fn navigations(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SiteEvent::Navigate(url) => Some(url.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn clicks(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SiteEvent::Click(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn screenshot_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, SiteEvent::Screenshot(_)))
            .count()
    }

    pub fn count(&self, wanted: &SiteEvent) -> usize {
        self.events.iter().filter(|event| *event == wanted).count()
    }

    fn current_page(&self) -> Option<&FakePage> {
        self.current.as_ref().and_then(|url| self.pages.get(url))
    }
}

fn label(control: &Control) -> String {
    control
        .attribute("text")
        .or_else(|| control.attribute("name"))
        .unwrap_or_default()
        .to_string()
}

impl BrowserDriver for FakeSite {
    fn initialize(&mut self) -> Result<()> {
        self.current = None;
        self.events.push(SiteEvent::Initialize);
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        self.current = Some(url.to_string());
        self.events.push(SiteEvent::Navigate(url.to_string()));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        self.events.push(SiteEvent::Close);
        Ok(())
    }

    fn screenshot(&mut self, path: &Path) -> Result<()> {
        fs::write(path, b"").with_context(|| format!("write {}", path.display()))?;
        self.events.push(SiteEvent::Screenshot(path.to_path_buf()));
        Ok(())
    }

    fn current_url(&mut self) -> Result<String> {
        Ok(self
            .current
            .clone()
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    fn body_text(&mut self) -> Result<String> {
        Ok(self
            .current_page()
            .map(|page| page.body.clone())
            .unwrap_or_default())
    }

    fn buttons(&mut self) -> Result<Vec<Control>> {
        Ok(self
            .current_page()
            .map(|page| page.buttons.clone())
            .unwrap_or_default())
    }

    fn links(&mut self) -> Result<Vec<LinkRecord>> {
        Ok(self
            .current_page()
            .map(|page| page.links.clone())
            .unwrap_or_default())
    }

    fn text_fields(&mut self) -> Result<Vec<Control>> {
        Ok(self
            .current_page()
            .map(|page| page.text_fields.clone())
            .unwrap_or_default())
    }

    fn click(&mut self, control: &Control, _mode: ClickMode) -> Result<()> {
        let text = label(control);
        self.events.push(SiteEvent::Click(text.clone()));
        if self.failing_clicks.contains(&text) {
            return Err(anyhow!("element {text:?} not clickable"));
        }
        if let Some(target) = self.click_targets.get(&text) {
            self.current = Some(target.clone());
        }
        Ok(())
    }

    fn type_text(&mut self, control: &Control, text: &str) -> Result<()> {
        self.events.push(SiteEvent::Type {
            field: label(control),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// [`FakeSite`] behind the suspension-based driver trait.
#[derive(Debug, Clone, Default)]
pub struct AsyncFakeSite(pub FakeSite);

#[async_trait]
impl AsyncBrowserDriver for AsyncFakeSite {
    async fn initialize(&mut self) -> Result<()> {
        self.0.initialize()
    }
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.0.navigate(url)
    }
    async fn close(&mut self) -> Result<()> {
        self.0.close()
    }
    async fn screenshot(&mut self, path: &Path) -> Result<()> {
        self.0.screenshot(path)
    }
    async fn current_url(&mut self) -> Result<String> {
        self.0.current_url()
    }
    async fn body_text(&mut self) -> Result<String> {
        self.0.body_text()
    }
    async fn buttons(&mut self) -> Result<Vec<Control>> {
        self.0.buttons()
    }
    async fn links(&mut self) -> Result<Vec<LinkRecord>> {
        self.0.links()
    }
    async fn text_fields(&mut self) -> Result<Vec<Control>> {
        self.0.text_fields()
    }
    async fn click(&mut self, control: &Control, mode: ClickMode) -> Result<()> {
        self.0.click(control, mode)
    }
    async fn type_text(&mut self, control: &Control, text: &str) -> Result<()> {
        self.0.type_text(control, text)
    }
}

fn attributes(pairs: &[(&str, &str)]) -> Attributes {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// A button control labelled `text`.
pub fn button(text: &str) -> Control {
    Control {
        attributes: attributes(&[("tag", "button"), ("text", text)]),
        element_ref: None,
    }
}

/// A text field control named `name`.
pub fn text_field(name: &str) -> Control {
    Control {
        attributes: attributes(&[("tag", "input"), ("name", name)]),
        element_ref: None,
    }
}

pub fn link(href: &str) -> LinkRecord {
    LinkRecord {
        href: href.to_string(),
        attributes: Attributes::new(),
    }
}

/// Config with every settle delay zeroed and a fixed seed.
pub fn fast_config() -> AgentConfig {
    AgentConfig {
        seed: Some(7),
        action_timeout_secs: 5,
        settle: SettleConfig::none(),
        ..AgentConfig::default()
    }
}

/// Run `f` against a workbench over `driver` with fresh sessions and a temp job directory.
pub fn with_bench<D: BrowserDriver, R>(
    driver: &mut D,
    shopping: &dyn Oracle,
    verifier: &dyn Oracle,
    f: impl FnOnce(&mut Workbench<'_, '_, D>) -> R,
) -> R {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = JobDir::create(temp.path(), "job").expect("job dir");
    let pacer = Pacer::new(SettleConfig::none());
    let mut rng = StdRng::seed_from_u64(7);
    let mut shopping = OracleSession::new(shopping, "shopping", "test-model", false);
    let mut verifier = OracleSession::new(verifier, "verifier", "test-model", false);
    let mut bench = Workbench {
        driver,
        shopping: &mut shopping,
        verifier: &mut verifier,
        pacer: &pacer,
        dir: &dir,
        rng: &mut rng,
    };
    f(&mut bench)
}
