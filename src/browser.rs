#![forbid(unsafe_code)]

//! Headless-browser automation that mimics a user right-clicking the video
//! player and picking "Download video" from the context menu.
//!
//! Every inbound download request gets one isolated session: launch, navigate,
//! locate the player, open the context menu, trigger the download entry, then
//! poll the session workdir until the browser finishes writing the file. The
//! session is closed on every exit path so failed requests never leak a
//! Chrome process. Selector-driven automation against a third-party site is
//! brittle by nature; the tunables in [`AutomationConfig`] exist so a markup
//! change is a config edit, not a code change.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

/// File names Chrome uses while a download is still in flight, plus the
/// generic markers other browsers leave behind.
const PARTIAL_SUFFIXES: &[&str] = &[".crdownload", ".part", ".tmp", ".download"];

/// How often selector polls re-check the DOM.
const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Per-session tuning. Defaults mirror the timings the target site needs in
/// practice: 15s for the player to render, 8s + 5s for the two menu lookups,
/// 30s of download polling.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    pub chrome_bin: Option<PathBuf>,
    /// DOM container identifying the video player.
    pub player_selector: String,
    /// Fast-path CSS selector for the context menu download entry.
    pub menu_option_selector: String,
    /// Exact visible text of the download entry, used by the fallback lookup.
    pub menu_option_label: String,
    pub navigation_timeout: Duration,
    pub player_timeout: Duration,
    pub primary_menu_timeout: Duration,
    pub fallback_menu_timeout: Duration,
    /// Pause after scrolling the player into view so layout settles before we
    /// compute its center point.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            chrome_bin: None,
            player_selector: "div[data-e2e=\"video-player\"]".into(),
            menu_option_selector: "[data-e2e=\"right-click-menu-popover_download-video\"]".into(),
            menu_option_label: "Download video".into(),
            navigation_timeout: Duration::from_secs(30),
            player_timeout: Duration::from_secs(15),
            primary_menu_timeout: Duration::from_secs(8),
            fallback_menu_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            poll_attempts: 60,
        }
    }
}

/// Stage-labelled failures so the handler log names where a session died; the
/// HTTP caller only ever sees a generic 500 built from the message.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("failed to launch browser session: {0}")]
    Launch(String),
    #[error("navigation to {url} did not settle within {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("video player container did not appear within {0:?}")]
    PlayerNotFound(Duration),
    #[error("no '{label}' entry appeared in the context menu")]
    DownloadOptionNotFound { label: String },
    #[error("no completed download appeared within {0:?}")]
    DownloadTimeout(Duration),
    #[error("browser session error: {0}")]
    Session(String),
}

impl From<CdpError> for AutomationError {
    fn from(err: CdpError) -> Self {
        AutomationError::Session(err.to_string())
    }
}

/// Runs one full download session and returns the harvested artifact path
/// inside `workdir`. The browser is closed on every exit path.
pub async fn fetch_video(
    config: &AutomationConfig,
    target_url: &str,
    workdir: &Path,
) -> Result<PathBuf, AutomationError> {
    let (browser, event_loop) = launch(config).await?;
    let result = drive(&browser, config, target_url, workdir).await;
    close_session(browser, event_loop).await;
    result
}

async fn launch(
    config: &AutomationConfig,
) -> Result<(Browser, JoinHandle<()>), AutomationError> {
    let mut builder = BrowserConfig::builder().no_sandbox().window_size(1280, 800);
    if let Some(path) = &config.chrome_bin {
        builder = builder.chrome_executable(path);
    }
    let browser_config = builder.build().map_err(AutomationError::Launch)?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .map_err(|err| AutomationError::Launch(err.to_string()))?;

    // The handler stream must be driven for the CDP connection to make
    // progress; it ends when the browser goes away.
    let event_loop = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    Ok((browser, event_loop))
}

async fn drive(
    browser: &Browser,
    config: &AutomationConfig,
    target_url: &str,
    workdir: &Path,
) -> Result<PathBuf, AutomationError> {
    let page = browser.new_page("about:blank").await?;

    page.execute(
        SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(workdir.display().to_string())
            .build()
            .map_err(AutomationError::Session)?,
    )
    .await?;

    navigate(&page, config, target_url).await?;
    let player = wait_for_player(&page, config).await?;
    open_context_menu(&page, &player, config).await?;

    // Snapshot before anything can click the menu entry, so a download that
    // finishes quickly is still strictly newer than the snapshot.
    let snapshot =
        newest_mtime(workdir).map_err(|err| AutomationError::Session(err.to_string()))?;

    trigger_download_option(&page, config).await?;
    harvest(workdir, snapshot, config).await
}

async fn navigate(
    page: &Page,
    config: &AutomationConfig,
    target_url: &str,
) -> Result<(), AutomationError> {
    let settled = async {
        page.goto(target_url).await?;
        page.wait_for_navigation().await?;
        Ok::<(), CdpError>(())
    };
    timeout(config.navigation_timeout, settled)
        .await
        .map_err(|_| AutomationError::NavigationTimeout {
            url: target_url.to_string(),
            timeout: config.navigation_timeout,
        })??;
    Ok(())
}

async fn wait_for_player(
    page: &Page,
    config: &AutomationConfig,
) -> Result<Element, AutomationError> {
    let deadline = Instant::now() + config.player_timeout;
    loop {
        if let Ok(element) = page.find_element(config.player_selector.as_str()).await {
            return Ok(element);
        }
        if Instant::now() >= deadline {
            return Err(AutomationError::PlayerNotFound(config.player_timeout));
        }
        sleep(ELEMENT_POLL_INTERVAL).await;
    }
}

/// Scrolls the player into view and dispatches a right-click at its center so
/// the site opens its context menu.
async fn open_context_menu(
    page: &Page,
    player: &Element,
    config: &AutomationConfig,
) -> Result<(), AutomationError> {
    player.scroll_into_view().await?;
    sleep(config.settle_delay).await;
    let point = player.clickable_point().await?;

    for kind in [
        DispatchMouseEventType::MousePressed,
        DispatchMouseEventType::MouseReleased,
    ] {
        let event = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(point.x)
            .y(point.y)
            .button(MouseButton::Right)
            .click_count(1)
            .build()
            .map_err(AutomationError::Session)?;
        page.execute(event).await?;
    }
    Ok(())
}

/// Ordered menu lookup strategies. The CSS fast path survives most markup
/// revisions; the exact-text scan catches the rest.
enum MenuLocator<'a> {
    Css(&'a str),
    ExactText(&'a str),
}

async fn trigger_download_option(
    page: &Page,
    config: &AutomationConfig,
) -> Result<(), AutomationError> {
    let strategies = [
        (
            MenuLocator::Css(&config.menu_option_selector),
            config.primary_menu_timeout,
        ),
        (
            MenuLocator::ExactText(&config.menu_option_label),
            config.fallback_menu_timeout,
        ),
    ];

    // Strategies run sequentially, so the worst case is the sum of their
    // timeouts.
    for (locator, per_strategy_timeout) in strategies {
        if try_menu_locator(page, &locator, per_strategy_timeout).await? {
            return Ok(());
        }
    }

    Err(AutomationError::DownloadOptionNotFound {
        label: config.menu_option_label.clone(),
    })
}

async fn try_menu_locator(
    page: &Page,
    locator: &MenuLocator<'_>,
    per_strategy_timeout: Duration,
) -> Result<bool, AutomationError> {
    let deadline = Instant::now() + per_strategy_timeout;
    loop {
        let clicked = match locator {
            MenuLocator::Css(selector) => match page.find_element(*selector).await {
                Ok(entry) => {
                    // A synthetic element click, not a coordinate-based mouse
                    // event: the menu entry is transient and may move.
                    entry
                        .call_js_fn("function() { this.click(); }", false)
                        .await?;
                    true
                }
                Err(_) => false,
            },
            MenuLocator::ExactText(label) => page
                .evaluate(exact_text_click_script(label))
                .await?
                .into_value::<bool>()
                .unwrap_or(false),
        };

        if clicked {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(ELEMENT_POLL_INTERVAL).await;
    }
}

/// JS that clicks the first leaf node whose trimmed text matches the label
/// exactly. Returns whether anything was clicked.
fn exact_text_click_script(label: &str) -> String {
    let quoted = serde_json::to_string(label).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
            const label = {quoted};
            const nodes = document.querySelectorAll("li, a, button, span, div, [role='menuitem']");
            for (const node of nodes) {{
                if (node.childElementCount === 0 && node.textContent.trim() === label) {{
                    node.click();
                    return true;
                }}
            }}
            return false;
        }})()"#
    )
}

async fn harvest(
    workdir: &Path,
    snapshot: Option<SystemTime>,
    config: &AutomationConfig,
) -> Result<PathBuf, AutomationError> {
    for _ in 0..config.poll_attempts {
        sleep(config.poll_interval).await;
        if let Some(path) = completed_download_since(workdir, snapshot)
            .map_err(|err| AutomationError::Session(err.to_string()))?
        {
            return Ok(path);
        }
    }
    Err(AutomationError::DownloadTimeout(
        config.poll_interval * config.poll_attempts,
    ))
}

async fn close_session(mut browser: Browser, event_loop: JoinHandle<()>) {
    if let Err(err) = browser.close().await {
        eprintln!("Failed to close browser cleanly: {err}");
    }
    if let Err(err) = browser.wait().await {
        eprintln!("Failed to reap browser process: {err}");
    }
    event_loop.abort();
}

/// Newest modification time among regular files in `dir`, or `None` when the
/// directory holds no files yet.
fn newest_mtime(dir: &Path) -> io::Result<Option<SystemTime>> {
    let mut newest = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        if newest.is_none_or(|current| mtime > current) {
            newest = Some(mtime);
        }
    }
    Ok(newest)
}

fn is_partial_download(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    PARTIAL_SUFFIXES
        .iter()
        .any(|suffix| lowered.ends_with(suffix))
}

/// First completed file strictly newer than the snapshot. In-progress files
/// are identified by their partial-download suffix and skipped.
fn completed_download_since(
    dir: &Path,
    snapshot: Option<SystemTime>,
) -> io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if is_partial_download(name) {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        let is_new = match snapshot {
            Some(since) => mtime > since,
            None => true,
        };
        if is_new {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn newest_mtime_empty_dir_is_none() {
        let dir = tempdir().unwrap();
        assert!(newest_mtime(dir.path()).unwrap().is_none());
    }

    #[test]
    fn completed_download_requires_strictly_newer_mtime() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old.mp4"), b"old").unwrap();
        let snapshot = newest_mtime(dir.path()).unwrap();
        assert!(snapshot.is_some());

        assert!(
            completed_download_since(dir.path(), snapshot)
                .unwrap()
                .is_none()
        );

        thread::sleep(Duration::from_millis(50));
        fs::write(dir.path().join("fresh.mp4"), b"fresh").unwrap();

        let found = completed_download_since(dir.path(), snapshot)
            .unwrap()
            .unwrap();
        assert_eq!(found.file_name().unwrap(), "fresh.mp4");
    }

    #[test]
    fn completed_download_skips_partial_files() {
        let dir = tempdir().unwrap();
        let snapshot = newest_mtime(dir.path()).unwrap();

        fs::write(dir.path().join("video.mp4.crdownload"), b"...").unwrap();
        fs::write(dir.path().join("video.part"), b"...").unwrap();
        fs::write(dir.path().join("Video.TMP"), b"...").unwrap();
        assert!(
            completed_download_since(dir.path(), snapshot)
                .unwrap()
                .is_none()
        );

        fs::write(dir.path().join("video.mp4"), b"done").unwrap();
        let found = completed_download_since(dir.path(), snapshot)
            .unwrap()
            .unwrap();
        assert_eq!(found.file_name().unwrap(), "video.mp4");
    }

    #[test]
    fn completed_download_with_no_snapshot_accepts_any_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("clip.webm"), b"bytes").unwrap();
        let found = completed_download_since(dir.path(), None).unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "clip.webm");
    }

    #[tokio::test]
    async fn harvest_picks_up_late_arrivals() {
        let dir = tempdir().unwrap();
        let config = AutomationConfig {
            poll_interval: Duration::from_millis(10),
            poll_attempts: 50,
            ..AutomationConfig::default()
        };
        let snapshot = newest_mtime(dir.path()).unwrap();

        let target = dir.path().join("clip.mp4");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            fs::write(target, b"bytes").unwrap();
        });

        let found = harvest(dir.path(), snapshot, &config).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "clip.mp4");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn harvest_times_out_on_empty_dir() {
        let dir = tempdir().unwrap();
        let config = AutomationConfig {
            poll_interval: Duration::from_millis(5),
            poll_attempts: 3,
            ..AutomationConfig::default()
        };

        let err = harvest(dir.path(), None, &config).await.unwrap_err();
        assert!(matches!(err, AutomationError::DownloadTimeout(_)));
    }

    #[test]
    fn exact_text_click_script_quotes_label() {
        let script = exact_text_click_script("Download video");
        assert!(script.contains("\"Download video\""));

        let tricky = exact_text_click_script("say \"hi\"");
        assert!(tricky.contains("\\\"hi\\\""));
    }

    #[test]
    fn default_config_preserves_documented_timings() {
        let config = AutomationConfig::default();
        assert_eq!(config.player_timeout, Duration::from_secs(15));
        assert_eq!(config.primary_menu_timeout, Duration::from_secs(8));
        assert_eq!(config.fallback_menu_timeout, Duration::from_secs(5));
        assert_eq!(
            config.poll_interval * config.poll_attempts,
            Duration::from_secs(30)
        );
    }
}
