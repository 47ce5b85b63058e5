use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::capabilities::{InputAction, InputDevice, ScreenCapture};
use crate::config::ChromiumConfig;
use crate::error::AssistError;
use crate::types::{now_ms, Screenshot, WindowInfo};

/// A Chromium tab standing in for the user's screen: web apps are the "applications".
pub struct ChromiumScreen {
    page: Page,
    viewport: (u32, u32),
    app_urls: BTreeMap<String, String>,
    _browser: Browser,
}

fn device_error(e: anyhow::Error) -> AssistError {
    AssistError::CollaboratorUnavailable(format!("browser: {:#}", e))
}

/// Splits "ctrl+shift+a" into a CDP modifier mask and the key itself.
fn split_combo(combo: &str) -> (u32, String) {
    let mut mask = 0;
    let mut key = String::new();
    for part in combo.split('+').map(str::trim).filter(|p| !p.is_empty()) {
        match part.to_lowercase().as_str() {
            "alt" => mask |= 1,
            "ctrl" | "control" => mask |= 2,
            "meta" | "cmd" | "win" => mask |= 4,
            "shift" => mask |= 8,
            _ => key = part.to_string(),
        }
    }
    (mask, key)
}

/// Exact name first, then a configured name contained in the request ("打开微信").
fn lookup_app<'a>(apps: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    let name = name.trim();
    apps.get(name)
        .or_else(|| apps.iter().find(|(k, _)| name.contains(k.as_str())).map(|(_, v)| v))
        .map(String::as_str)
}

/// Host of a URL, used as the app name for pages not in the configured list.
fn host_of(url: &str) -> &str {
    let rest = url.split("://").nth(1).unwrap_or(url);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

impl ChromiumScreen {
    pub async fn launch(cfg: ChromiumConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Per-run profile dir; Chromium refuses to share a locked profile.
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("steady-hands-profile-{}-{}", std::process::id(), now_ms()));
        std::fs::create_dir_all(&profile_dir).context("creating browser profile dir")?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = Browser::launch(bcfg).await?;
        tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(cfg.viewport.0 as i64)
            .height(cfg.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        page.execute(metrics).await?;
        info!(width = cfg.viewport.0, height = cfg.viewport.1, apps = cfg.app_urls.len(), "browser screen ready");
        Ok(Self { page, viewport: cfg.viewport, app_urls: cfg.app_urls, _browser: browser })
    }

    async fn window(&self) -> Result<WindowInfo> {
        let url = self.page.url().await?.unwrap_or_default();
        let title = self.page.get_title().await?;
        let app = self
            .app_urls
            .iter()
            .find(|(_, u)| host_of(u) == host_of(&url))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| {
                if url.is_empty() || url == "about:blank" {
                    "desktop".into()
                } else {
                    host_of(&url).to_string()
                }
            });
        Ok(WindowInfo { app, title })
    }

    async fn screenshot(&self) -> Result<Screenshot> {
        let png = self
            .page
            .screenshot(ScreenshotParams::builder().full_page(false).build())
            .await?;
        let window = self.window().await?;
        Ok(Screenshot::new(self.viewport.0, self.viewport.1, Some(STANDARD.encode(png)), Some(window)))
    }

    async fn click(&self, x: i64, y: i64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(MouseButton::Left)
            .click_count(1);
        self.page.move_mouse(Point { x: x as f64, y: y as f64 }).await?;
        self.page
            .execute(cmd.clone().r#type(DispatchMouseEventType::MousePressed).build().map_err(|e| anyhow!(e))?)
            .await?;
        self.page
            .execute(cmd.r#type(DispatchMouseEventType::MouseReleased).build().map_err(|e| anyhow!(e))?)
            .await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams { text: text.to_string() }).await?;
        Ok(())
    }

    async fn key(&self, combo: &str) -> Result<()> {
        let (mask, key) = split_combo(combo);
        if key.is_empty() {
            return Err(anyhow!("key combo {:?} names no key", combo));
        }
        let js = format!(
            r#"(function() {{
                const el = document.activeElement || document.body;
                const opts = {{key: {k}, code: {k}, bubbles: true,
                    altKey: {alt}, ctrlKey: {ctrl}, metaKey: {meta}, shiftKey: {shift}}};
                el.dispatchEvent(new KeyboardEvent("keydown", opts));
                el.dispatchEvent(new KeyboardEvent("keyup", opts));
            }})()"#,
            k = serde_json::to_string(&key)?,
            alt = mask & 1 != 0,
            ctrl = mask & 2 != 0,
            meta = mask & 4 != 0,
            shift = mask & 8 != 0,
        );
        let eval = EvaluateParams::builder().expression(js).build().map_err(|e| anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    async fn open_app(&self, name: &str) -> Result<()> {
        let url = lookup_app(&self.app_urls, name).ok_or_else(|| anyhow!("no web address known for {:?}", name))?;
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }
}

#[async_trait]
impl ScreenCapture for ChromiumScreen {
    async fn capture(&self) -> Result<Screenshot, AssistError> {
        self.screenshot().await.map_err(device_error)
    }
}

#[async_trait]
impl InputDevice for ChromiumScreen {
    async fn perform(&self, action: &InputAction) -> Result<(), AssistError> {
        debug!(?action, "browser input");
        let res = match action {
            InputAction::Click { x, y } => self.click(*x, *y).await,
            InputAction::Type { text } => self.type_text(text).await,
            InputAction::Key { combo } => self.key(combo).await,
            InputAction::OpenApp { name } => self.open_app(name).await,
            InputAction::None => Ok(()),
        };
        res.map_err(device_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combos_split_into_modifiers_and_key() {
        assert_eq!(split_combo("ctrl+shift+a"), (10, "a".to_string()));
        assert_eq!(split_combo("Enter"), (0, "Enter".to_string()));
        assert_eq!(split_combo("ctrl+"), (2, String::new()));
    }

    #[test]
    fn apps_are_found_inside_longer_requests() {
        let mut apps = BTreeMap::new();
        apps.insert("微信".to_string(), "https://wx.qq.com".to_string());
        assert_eq!(lookup_app(&apps, "微信"), Some("https://wx.qq.com"));
        assert_eq!(lookup_app(&apps, "打开微信"), Some("https://wx.qq.com"));
        assert_eq!(lookup_app(&apps, "支付宝"), None);
    }

    #[test]
    fn host_ignores_scheme_and_path() {
        assert_eq!(host_of("https://news.baidu.com/guonei?x=1"), "news.baidu.com");
        assert_eq!(host_of("wx.qq.com"), "wx.qq.com");
    }
}
