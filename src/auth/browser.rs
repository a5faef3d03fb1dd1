use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Url;

/// Opens the authorization URL for the user.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, url: &Url) -> Result<()>;
}

/// The user's default browser.
pub struct SystemBrowser;

#[async_trait]
impl Launcher for SystemBrowser {
    async fn launch(&self, url: &Url) -> Result<()> {
        let target = url.to_string();
        // detached: a terminal browser must not hold the flow
        tokio::task::spawn_blocking(move || open::that_detached(&target))
            .await
            .context("browser launch task failed")?
            .context("failed to open browser")
    }
}

/// Never opens anything; the caller prints the URL instead.
pub struct NoBrowser;

#[async_trait]
impl Launcher for NoBrowser {
    async fn launch(&self, _url: &Url) -> Result<()> {
        bail!("automatic browser launch disabled")
    }
}
