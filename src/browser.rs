use headless_chrome::{Browser, LaunchOptions};
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::PathBuf;

/// Launches the Chrome instance that serves one whole batch.
///
/// Flags assume a containerized deployment where the sandbox and
/// /dev/shm are unavailable.
pub fn launch() -> Result<Browser> {
    let args = vec![
        OsStr::new("--disable-blink-features=AutomationControlled"),
        OsStr::new("--no-sandbox"),
        OsStr::new("--disable-dev-shm-usage"),
        OsStr::new("--disable-gpu"),
        OsStr::new("--ignore-certificate-errors"),
    ];

    let browser = Browser::new(LaunchOptions {
        headless: true,
        window_size: Some((1280, 800)),
        path: executable_override(),
        args,
        ..Default::default()
    })
    .context("failed to launch Chrome")?;

    Ok(browser)
}

/// Launch-and-drop check behind GET /chrome-status. Getting as far as a
/// connected browser proves the binary and the DevTools socket work.
pub fn probe() -> Result<()> {
    let browser = launch()?;
    drop(browser);
    Ok(())
}

/// Optional CHROME_PATH override for images that ship their own
/// Chromium build; otherwise the library's default discovery runs.
fn executable_override() -> Option<PathBuf> {
    std::env::var("CHROME_PATH").ok().map(PathBuf::from)
}
