//! Page-level operator: captures the viewport over CDP and simulates
//! mouse/keyboard within the page content.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::agent::state::{Action, ScrollDirection};
use crate::errors::{PilotError, PilotResult};
use crate::operator::types::{
    ExecuteParams, ExecutionResult, PixelPoint, ScreenshotContext, ScreenshotOutput,
};
use crate::operator::Operator;

const JPEG_QUALITY: u32 = 75;
const SCROLL_PIXELS: i32 = 400;

pub struct BrowserOperator {
    tab: Arc<Tab>,
    /// Keeps the Chrome process alive when this operator launched it.
    _browser: Option<Browser>,
    user_intent: Mutex<Option<String>>,
}

impl BrowserOperator {
    /// Wraps an already-connected tab.
    pub fn attach(tab: Arc<Tab>) -> Self {
        Self { tab, _browser: None, user_intent: Mutex::new(None) }
    }

    /// Launches a visible Chrome instance with a fresh tab.
    pub fn launch() -> PilotResult<Self> {
        let options = LaunchOptions {
            headless: false,
            ..Default::default()
        };
        let browser = Browser::new(options)
            .map_err(|e| PilotError::Capture(format!("browser launch failed: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| PilotError::Capture(format!("tab creation failed: {e}")))?;
        Ok(Self { tab, _browser: Some(browser), user_intent: Mutex::new(None) })
    }

    pub fn navigate(&self, url: &str) -> PilotResult<()> {
        self.tab
            .navigate_to(url)
            .and_then(|t| t.wait_until_navigated())
            .map_err(|e| PilotError::Capture(format!("navigation failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Operator for BrowserOperator {
    fn name(&self) -> &str {
        "browser"
    }

    async fn screenshot(&self) -> PilotResult<ScreenshotOutput> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || {
            let context = viewport_context(&tab)?;
            let data = tab
                .capture_screenshot(
                    Page::CaptureScreenshotFormatOption::Jpeg,
                    Some(JPEG_QUALITY),
                    None,
                    true,
                )
                .map_err(|e| PilotError::Capture(format!("page capture failed: {e}")))?;
            Ok(ScreenshotOutput {
                base64: base64::engine::general_purpose::STANDARD.encode(&data),
                context,
            })
        })
        .await
        .map_err(|e| PilotError::Capture(format!("capture task panicked: {e}")))?
    }

    async fn execute(&self, params: ExecuteParams) -> PilotResult<ExecutionResult> {
        let tab = self.tab.clone();
        let kind = params.action.kind();
        let action = params.action.clone();
        tokio::task::spawn_blocking(move || {
            let kind = action.kind();
            match action {
                Action::Click { .. } => {
                    let p = css_point(&tab, kind, params.start)?;
                    dispatch_mouse(&tab, MouseGesture::Click, p)
                }
                Action::DoubleClick { .. } => {
                    let p = css_point(&tab, kind, params.start)?;
                    dispatch_mouse(&tab, MouseGesture::DoubleClick, p)
                }
                Action::RightClick { .. } => {
                    let p = css_point(&tab, kind, params.start)?;
                    dispatch_mouse(&tab, MouseGesture::RightClick, p)
                }
                Action::Drag { .. } => {
                    let start = css_point(&tab, kind, params.start)?;
                    let end = css_point(&tab, kind, params.end)?;
                    dispatch_drag(&tab, start, end)
                }
                Action::Type { content } => type_into_page(&tab, &content),
                Action::Hotkey { key } => dispatch_hotkey(&tab, &key),
                Action::Scroll { direction, .. } => scroll_page(&tab, direction),
                other => Err(PilotError::execution(
                    other.kind(),
                    "not dispatchable by the operator",
                )),
            }
        })
        .await
        .map_err(|e| PilotError::execution(kind, format!("page task panicked: {e}")))?
    }

    fn set_user_intent(&self, intent: &str) {
        *self.user_intent.lock().unwrap() = Some(intent.to_string());
    }

    fn user_intent(&self) -> Option<String> {
        self.user_intent.lock().unwrap().clone()
    }
}

/// Execution errors that indicate the page is gone are fatal to the run.
fn page_err(kind: &str, e: impl std::fmt::Display) -> PilotError {
    let message = e.to_string();
    let lowered = message.to_ascii_lowercase();
    let unrecoverable = ["connection", "websocket", "channel", "closed"]
        .iter()
        .any(|needle| lowered.contains(needle));
    PilotError::Execution { action: kind.to_string(), message, unrecoverable }
}

fn eval_value(tab: &Tab, kind: &str, js: &str) -> PilotResult<serde_json::Value> {
    let object = tab.evaluate(js, false).map_err(|e| page_err(kind, e))?;
    object
        .value
        .ok_or_else(|| PilotError::execution(kind, "page evaluation returned nothing"))
}

fn viewport_context(tab: &Tab) -> PilotResult<ScreenshotContext> {
    let value = eval_value(
        tab,
        "screenshot",
        "JSON.stringify({w: window.innerWidth, h: window.innerHeight, \
         dpr: window.devicePixelRatio})",
    )
    .map_err(|e| PilotError::Capture(e.to_string()))?;
    let raw = value
        .as_str()
        .ok_or_else(|| PilotError::Capture("viewport metrics unavailable".into()))?;
    let metrics: serde_json::Value = serde_json::from_str(raw)?;

    let logical_width = metrics["w"].as_f64().unwrap_or(0.0);
    let logical_height = metrics["h"].as_f64().unwrap_or(0.0);
    let scale_factor = metrics["dpr"].as_f64().unwrap_or(1.0);
    let context = ScreenshotContext {
        logical_width: logical_width.round() as u32,
        logical_height: logical_height.round() as u32,
        physical_width: (logical_width * scale_factor).round() as u32,
        physical_height: (logical_height * scale_factor).round() as u32,
        scale_factor,
        source_id: tab.get_target_id().clone(),
    };
    context.validate()?;
    Ok(context)
}

/// Resolved pixels are physical; page events take CSS pixels.
fn css_point(tab: &Tab, kind: &str, p: Option<PixelPoint>) -> PilotResult<(f64, f64)> {
    let p = p.ok_or_else(|| PilotError::execution(kind, "missing resolved coordinates"))?;
    let dpr = eval_value(tab, kind, "window.devicePixelRatio")?
        .as_f64()
        .filter(|v| *v > 0.0)
        .unwrap_or(1.0);
    Ok((p.x as f64 / dpr, p.y as f64 / dpr))
}

enum MouseGesture {
    Click,
    DoubleClick,
    RightClick,
}

fn dispatch_mouse(
    tab: &Tab,
    gesture: MouseGesture,
    (x, y): (f64, f64),
) -> PilotResult<ExecutionResult> {
    let (kind, events) = match gesture {
        MouseGesture::Click => ("click", "['mousedown','mouseup','click']"),
        MouseGesture::DoubleClick => {
            ("double_click", "['mousedown','mouseup','click','mousedown','mouseup','click','dblclick']")
        }
        MouseGesture::RightClick => ("right_click", "['mousedown','mouseup','contextmenu']"),
    };
    let button = if matches!(gesture, MouseGesture::RightClick) { 2 } else { 0 };
    let js = format!(
        "(function() {{\
           const el = document.elementFromPoint({x}, {y});\
           if (!el) return '';\
           const opts = {{bubbles: true, cancelable: true, view: window, \
                          clientX: {x}, clientY: {y}, button: {button}}};\
           for (const type of {events}) el.dispatchEvent(new MouseEvent(type, opts));\
           if (el.focus) el.focus();\
           return el.tagName;\
         }})()"
    );
    let tag = eval_value(tab, kind, &js)?;
    match tag.as_str() {
        Some(name) if !name.is_empty() => {
            Ok(ExecutionResult::ok_with(format!("{kind} on <{}>", name.to_ascii_lowercase())))
        }
        _ => Err(PilotError::execution(
            kind,
            format!("no interactable element at ({x:.0}, {y:.0})"),
        )),
    }
}

fn dispatch_drag(
    tab: &Tab,
    (sx, sy): (f64, f64),
    (ex, ey): (f64, f64),
) -> PilotResult<ExecutionResult> {
    let js = format!(
        "(function() {{\
           const from = document.elementFromPoint({sx}, {sy});\
           if (!from) return '';\
           const fire = (el, type, x, y) => el.dispatchEvent(new MouseEvent(type, \
             {{bubbles: true, cancelable: true, view: window, clientX: x, clientY: y}}));\
           fire(from, 'mousedown', {sx}, {sy});\
           for (let i = 1; i <= 8; i++) {{\
             const x = {sx} + ({ex} - {sx}) * i / 8;\
             const y = {sy} + ({ey} - {sy}) * i / 8;\
             fire(document.elementFromPoint(x, y) || from, 'mousemove', x, y);\
           }}\
           const to = document.elementFromPoint({ex}, {ey}) || from;\
           fire(to, 'mouseup', {ex}, {ey});\
           return from.tagName;\
         }})()"
    );
    let tag = eval_value(tab, "drag", &js)?;
    match tag.as_str() {
        Some(name) if !name.is_empty() => Ok(ExecutionResult::ok_with(format!(
            "dragged <{}> to ({ex:.0}, {ey:.0})",
            name.to_ascii_lowercase()
        ))),
        _ => Err(PilotError::execution("drag", "no element at drag origin")),
    }
}

fn type_into_page(tab: &Tab, content: &str) -> PilotResult<ExecutionResult> {
    let (text, submit) = super::computer::strip_submit_marker(content);
    if !text.is_empty() {
        tab.type_str(&text).map_err(|e| page_err("type", e))?;
    }
    if submit {
        tab.press_key("Enter").map_err(|e| page_err("type", e))?;
    }
    Ok(ExecutionResult::ok())
}

fn dispatch_hotkey(tab: &Tab, combo: &str) -> PilotResult<ExecutionResult> {
    let tokens: Vec<String> = combo
        .split(|c: char| c == '+' || c.is_whitespace())
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let Some((key, modifiers)) = tokens.split_last() else {
        return Err(PilotError::execution("hotkey", "empty key combination"));
    };

    let has = |m: &str| modifiers.iter().any(|t| t == m);
    let event_key = match key.as_str() {
        "enter" | "return" => "Enter".to_string(),
        "tab" => "Tab".to_string(),
        "esc" | "escape" => "Escape".to_string(),
        "space" => " ".to_string(),
        "backspace" => "Backspace".to_string(),
        "delete" | "del" => "Delete".to_string(),
        "up" => "ArrowUp".to_string(),
        "down" => "ArrowDown".to_string(),
        "left" => "ArrowLeft".to_string(),
        "right" => "ArrowRight".to_string(),
        other => other.to_string(),
    };
    let js = format!(
        "(function() {{\
           const target = document.activeElement || document.body;\
           const opts = {{bubbles: true, cancelable: true, key: '{event_key}', \
                          ctrlKey: {ctrl}, shiftKey: {shift}, altKey: {alt}, metaKey: {meta}}};\
           target.dispatchEvent(new KeyboardEvent('keydown', opts));\
           target.dispatchEvent(new KeyboardEvent('keyup', opts));\
           return target.tagName;\
         }})()",
        ctrl = has("ctrl") || has("control"),
        shift = has("shift"),
        alt = has("alt"),
        meta = has("meta") || has("cmd") || has("command") || has("super"),
    );
    eval_value(tab, "hotkey", &js)?;
    Ok(ExecutionResult::ok_with(format!("pressed {combo}")))
}

fn scroll_page(tab: &Tab, direction: ScrollDirection) -> PilotResult<ExecutionResult> {
    let (dx, dy) = match direction {
        ScrollDirection::Down => (0, SCROLL_PIXELS),
        ScrollDirection::Up => (0, -SCROLL_PIXELS),
        ScrollDirection::Right => (SCROLL_PIXELS, 0),
        ScrollDirection::Left => (-SCROLL_PIXELS, 0),
    };
    let js = format!("window.scrollBy({dx}, {dy}); true");
    eval_value(tab, "scroll", &js)?;
    Ok(ExecutionResult::ok())
}
