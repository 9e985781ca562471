//! Everything one phase needs to act on a site: a driver, both oracle
//! sessions, settle delays, the job directory and the job's RNG.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::core::types::Control;
use crate::io::artifacts::JobDir;
use crate::io::driver::{BrowserDriver, ClickMode, Pacer};
use crate::io::oracle::OracleSession;

pub struct Workbench<'w, 'o, D> {
    pub driver: &'w mut D,
    pub shopping: &'w mut OracleSession<'o>,
    pub verifier: &'w mut OracleSession<'o>,
    pub pacer: &'w Pacer,
    pub dir: &'w JobDir,
    pub rng: &'w mut StdRng,
}

impl<D: BrowserDriver> Workbench<'_, '_, D> {
    /// Settle, then capture the page as `<name>.png` in the job directory.
    pub fn snapshot(&mut self, name: &str) -> Result<PathBuf> {
        self.pacer.observe();
        let path = self.dir.image(name);
        self.driver
            .screenshot(&path)
            .with_context(|| format!("screenshot {name}"))?;
        debug!(path = %path.display(), "captured screenshot");
        Ok(path)
    }

    pub fn goto(&mut self, url: &str) -> Result<()> {
        self.driver
            .navigate(url)
            .with_context(|| format!("navigate to {url}"))?;
        self.pacer.navigation();
        Ok(())
    }

    pub fn current_url(&mut self) -> Result<String> {
        self.driver.current_url().context("read current url")
    }

    /// Click a candidate control. A failed click is reported as `false`, not an error.
    pub fn try_click(&mut self, control: &Control, mode: ClickMode) -> bool {
        let clicked = match self.driver.click(control, mode) {
            Ok(()) => true,
            Err(e) => {
                warn!(err = %e, control = %control, "click failed");
                false
            }
        };
        self.pacer.action();
        clicked
    }

    /// Re-navigate to `url` when an action moved the browser elsewhere.
    ///
    /// Returns true if a rollback was needed.
    pub fn rollback_if_moved(&mut self, url: &str) -> Result<bool> {
        let now = self.current_url()?;
        if now == url {
            return Ok(false);
        }
        debug!(from = %now, to = %url, "action navigated away, returning");
        self.goto(url)?;
        Ok(true)
    }

    /// Restart the browser session. The driver is left on a blank page.
    pub fn recycle(&mut self) -> Result<()> {
        if let Err(e) = self.driver.close() {
            warn!(err = %e, "closing driver before recycle failed");
        }
        self.pacer.recycle_close();
        self.driver.initialize().context("reinitialize driver")?;
        self.pacer.recycle_init();
        Ok(())
    }

    /// Close the driver, logging instead of failing.
    pub fn close_quietly(&mut self) {
        if let Err(e) = self.driver.close() {
            warn!(err = %e, "closing driver failed");
        }
    }
}
