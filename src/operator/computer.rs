//! OS-level operator: captures the display with `xcap` and injects input
//! with `enigo`.

use std::sync::Mutex;
use std::time::Duration;

use arboard::Clipboard;
use async_trait::async_trait;
use base64::Engine as _;
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::agent::state::{Action, ScrollDirection};
use crate::errors::{PilotError, PilotResult};
use crate::operator::types::{
    ExecuteParams, ExecutionResult, PixelPoint, ScreenshotContext, ScreenshotOutput,
};
use crate::operator::Operator;

const JPEG_QUALITY: u8 = 75;
const SCROLL_STEP: i32 = 5;
const DRAG_STEPS: i32 = 12;
/// Time for the paste shortcut to be consumed before the clipboard is
/// restored.
const PASTE_SETTLE: Duration = Duration::from_millis(120);

pub struct ComputerOperator {
    user_intent: Mutex<Option<String>>,
}

impl ComputerOperator {
    pub fn new() -> Self {
        Self { user_intent: Mutex::new(None) }
    }
}

impl Default for ComputerOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for ComputerOperator {
    fn name(&self) -> &str {
        "computer"
    }

    async fn screenshot(&self) -> PilotResult<ScreenshotOutput> {
        run_blocking("screenshot", || capture_display(DisplayPick::Primary)).await
    }

    fn has_capture_fallback(&self) -> bool {
        true
    }

    async fn fallback_screenshot(&self) -> PilotResult<ScreenshotOutput> {
        run_blocking("screenshot", || capture_display(DisplayPick::Secondary)).await
    }

    async fn execute(&self, params: ExecuteParams) -> PilotResult<ExecutionResult> {
        let kind = params.action.kind();
        match params.action.clone() {
            Action::Click { .. } => {
                let p = require_point(kind, params.start)?;
                run_blocking(kind, move || click_at("click", p, Button::Left, 1)).await
            }
            Action::DoubleClick { .. } => {
                let p = require_point(kind, params.start)?;
                run_blocking(kind, move || click_at("double_click", p, Button::Left, 2)).await
            }
            Action::RightClick { .. } => {
                let p = require_point(kind, params.start)?;
                run_blocking(kind, move || click_at("right_click", p, Button::Right, 1)).await
            }
            Action::Drag { .. } => {
                let start = require_point(kind, params.start)?;
                let end = require_point(kind, params.end)?;
                run_blocking(kind, move || drag(start, end)).await
            }
            Action::Hotkey { key } => run_blocking(kind, move || press_hotkey(&key)).await,
            Action::Type { content } => run_blocking(kind, move || type_text(&content)).await,
            Action::Scroll { direction, .. } => {
                let at = params.start;
                run_blocking(kind, move || scroll(direction, at)).await
            }
            other => Err(PilotError::execution(
                other.kind(),
                "not dispatchable by the operator",
            )),
        }
    }

    fn set_user_intent(&self, intent: &str) {
        *self.user_intent.lock().unwrap() = Some(intent.to_string());
    }

    fn user_intent(&self) -> Option<String> {
        self.user_intent.lock().unwrap().clone()
    }
}

/// Input injection is synchronous platform API; keep it off the async
/// executor.
async fn run_blocking<T, F>(kind: &str, f: F) -> PilotResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> PilotResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PilotError::execution(kind, format!("input task panicked: {e}")))?
}

fn require_point(kind: &str, point: Option<PixelPoint>) -> PilotResult<PixelPoint> {
    point.ok_or_else(|| PilotError::execution(kind, "missing resolved coordinates"))
}

enum DisplayPick {
    Primary,
    Secondary,
}

fn capture_display(pick: DisplayPick) -> PilotResult<ScreenshotOutput> {
    let monitors = xcap::Monitor::all()
        .map_err(|e| PilotError::Capture(format!("monitor enumeration failed: {e}")))?;
    if monitors.is_empty() {
        return Err(PilotError::Capture("no capture source available".into()));
    }
    let monitor = match pick {
        DisplayPick::Primary => monitors
            .iter()
            .find(|m| m.is_primary())
            .unwrap_or(&monitors[0]),
        DisplayPick::Secondary => monitors.iter().find(|m| !m.is_primary()).ok_or_else(|| {
            PilotError::Capture("no secondary display to fall back to".into())
        })?,
    };

    let image = monitor
        .capture_image()
        .map_err(|e| PilotError::Capture(format!("capture failed: {e}")))?;
    let (physical_width, physical_height) = image.dimensions();

    // `xcap` re-exports an older `image` version than this crate depends on, so the
    // captured buffer must be rebuilt through this crate's `image` types before use.
    let rgba = image::RgbaImage::from_raw(physical_width, physical_height, image.into_raw())
        .ok_or_else(|| PilotError::Capture("capture buffer size mismatch".into()))?;
    let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();
    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder
        .encode(
            rgb.as_raw(),
            physical_width,
            physical_height,
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| PilotError::Capture(format!("jpeg encoding failed: {e}")))?;

    let scale_factor = monitor.scale_factor() as f64;
    let context = ScreenshotContext {
        logical_width: (physical_width as f64 / scale_factor).round() as u32,
        logical_height: (physical_height as f64 / scale_factor).round() as u32,
        physical_width,
        physical_height,
        scale_factor,
        source_id: monitor.id().to_string(),
    };
    context.validate()?;

    tracing::debug!(
        monitor = %context.source_id,
        physical = %format!("{physical_width}x{physical_height}"),
        scale = scale_factor,
        "display captured"
    );

    Ok(ScreenshotOutput {
        base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
        context,
    })
}

fn new_enigo(kind: &str) -> PilotResult<Enigo> {
    Enigo::new(&Settings::default())
        .map_err(|e| PilotError::execution(kind, format!("input driver unavailable: {e}")))
}

fn input_err(kind: &'static str) -> impl Fn(enigo::InputError) -> PilotError + Copy {
    move |e| PilotError::execution(kind, e.to_string())
}

fn click_at(
    kind: &'static str,
    p: PixelPoint,
    button: Button,
    count: u32,
) -> PilotResult<ExecutionResult> {
    let mut enigo = new_enigo(kind)?;
    enigo.move_mouse(p.x, p.y, Coordinate::Abs).map_err(input_err(kind))?;
    for i in 0..count {
        if i > 0 {
            std::thread::sleep(Duration::from_millis(40));
        }
        enigo.button(button, Direction::Click).map_err(input_err(kind))?;
    }
    Ok(ExecutionResult::ok_with(format!("clicked at ({}, {})", p.x, p.y)))
}

fn drag(start: PixelPoint, end: PixelPoint) -> PilotResult<ExecutionResult> {
    let err = input_err("drag");
    let mut enigo = new_enigo("drag")?;
    enigo.move_mouse(start.x, start.y, Coordinate::Abs).map_err(err)?;
    enigo.button(Button::Left, Direction::Press).map_err(err)?;
    std::thread::sleep(Duration::from_millis(40));
    for step in 1..=DRAG_STEPS {
        let t = step as f64 / DRAG_STEPS as f64;
        let x = start.x + ((end.x - start.x) as f64 * t).round() as i32;
        let y = start.y + ((end.y - start.y) as f64 * t).round() as i32;
        enigo.move_mouse(x, y, Coordinate::Abs).map_err(err)?;
        std::thread::sleep(Duration::from_millis(10));
    }
    let release = enigo.button(Button::Left, Direction::Release);
    release.map_err(err)?;
    Ok(ExecutionResult::ok_with(format!(
        "dragged ({}, {}) -> ({}, {})",
        start.x, start.y, end.x, end.y
    )))
}

fn scroll(direction: ScrollDirection, at: Option<PixelPoint>) -> PilotResult<ExecutionResult> {
    let err = input_err("scroll");
    let mut enigo = new_enigo("scroll")?;
    if let Some(p) = at {
        enigo.move_mouse(p.x, p.y, Coordinate::Abs).map_err(err)?;
    }
    let (length, axis) = match direction {
        ScrollDirection::Down => (SCROLL_STEP, Axis::Vertical),
        ScrollDirection::Up => (-SCROLL_STEP, Axis::Vertical),
        ScrollDirection::Right => (SCROLL_STEP, Axis::Horizontal),
        ScrollDirection::Left => (-SCROLL_STEP, Axis::Horizontal),
    };
    enigo.scroll(length, axis).map_err(err)?;
    Ok(ExecutionResult::ok())
}

fn press_hotkey(combo: &str) -> PilotResult<ExecutionResult> {
    let err = input_err("hotkey");
    let tokens = split_key_combo(combo);
    if tokens.is_empty() {
        return Err(PilotError::execution("hotkey", "empty key combination"));
    }
    let keys: Vec<Key> = tokens
        .iter()
        .map(|t| key_for_token(t))
        .collect::<PilotResult<_>>()?;

    let mut enigo = new_enigo("hotkey")?;
    let (last, modifiers) = keys.split_last().expect("non-empty");
    for key in modifiers {
        enigo.key(*key, Direction::Press).map_err(err)?;
    }
    let pressed = enigo.key(*last, Direction::Click);
    // release held modifiers even when the main key failed
    for key in modifiers.iter().rev() {
        let _ = enigo.key(*key, Direction::Release);
    }
    pressed.map_err(err)?;
    Ok(ExecutionResult::ok_with(format!("pressed {combo}")))
}

fn type_text(content: &str) -> PilotResult<ExecutionResult> {
    let (text, submit) = strip_submit_marker(content);
    let mut enigo = new_enigo("type")?;

    if !text.is_empty() {
        if needs_clipboard(&text) {
            type_via_clipboard(&mut enigo, &text)?;
        } else {
            enigo.text(&text).map_err(input_err("type"))?;
        }
    }
    if submit {
        enigo.key(Key::Return, Direction::Click).map_err(input_err("type"))?;
    }
    Ok(ExecutionResult::ok())
}

/// A trailing `\n` (or the literal two-character `\\n` the model often
/// emits) is a submit marker, not text: strip it and press Return instead.
pub(crate) fn strip_submit_marker(content: &str) -> (String, bool) {
    // trim spaces but keep a trailing newline visible as the marker
    let mut text = content
        .trim_start()
        .trim_end_matches(|c| c == ' ' || c == '\t');
    let mut submit = false;
    loop {
        let mut stripped_any = false;
        for marker in ["\\n", "\n"] {
            if let Some(stripped) = text.strip_suffix(marker) {
                text = stripped;
                submit = true;
                stripped_any = true;
            }
        }
        if !stripped_any {
            break;
        }
    }
    (text.trim_end().to_string(), submit)
}

/// Direct key simulation is unreliable for text outside the ASCII range
/// (CJK and other IME-composed scripts); those go through the clipboard.
fn needs_clipboard(text: &str) -> bool {
    !text.is_ascii()
}

/// Restores the pre-action clipboard on drop, whatever happened in
/// between.
struct ClipboardRestore {
    saved: Option<String>,
}

impl Drop for ClipboardRestore {
    fn drop(&mut self) {
        match Clipboard::new() {
            Ok(mut clipboard) => {
                let outcome = match self.saved.take() {
                    Some(text) => clipboard.set_text(text),
                    None => clipboard.clear(),
                };
                if let Err(e) = outcome {
                    tracing::warn!(error = %e, "clipboard restore failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "clipboard unavailable for restore"),
        }
    }
}

fn type_via_clipboard(enigo: &mut Enigo, text: &str) -> PilotResult<()> {
    let mut clipboard = Clipboard::new()
        .map_err(|e| PilotError::execution("type", format!("clipboard unavailable: {e}")))?;
    let _restore = ClipboardRestore { saved: clipboard.get_text().ok() };

    clipboard
        .set_text(text.to_string())
        .map_err(|e| PilotError::execution("type", format!("clipboard write failed: {e}")))?;
    paste_shortcut(enigo)?;
    std::thread::sleep(PASTE_SETTLE);
    Ok(())
}

fn paste_shortcut(enigo: &mut Enigo) -> PilotResult<()> {
    let err = input_err("type");
    #[cfg(target_os = "macos")]
    let modifier = Key::Meta;
    #[cfg(not(target_os = "macos"))]
    let modifier = Key::Control;

    enigo.key(modifier, Direction::Press).map_err(err)?;
    let pressed = enigo.key(Key::Unicode('v'), Direction::Click);
    let _ = enigo.key(modifier, Direction::Release);
    pressed.map_err(err)?;
    Ok(())
}

fn split_key_combo(combo: &str) -> Vec<String> {
    combo
        .split(|c: char| c == '+' || c.is_whitespace())
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn key_for_token(token: &str) -> PilotResult<Key> {
    let key = match token {
        "ctrl" | "control" => Key::Control,
        "alt" => Key::Alt,
        "shift" => Key::Shift,
        "meta" | "cmd" | "command" | "win" | "super" => Key::Meta,
        "enter" | "return" => Key::Return,
        "tab" => Key::Tab,
        "esc" | "escape" => Key::Escape,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "page_up" => Key::PageUp,
        "pagedown" | "page_down" => Key::PageDown,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        single if single.chars().count() == 1 => {
            Key::Unicode(single.chars().next().expect("one char"))
        }
        other => {
            return Err(PilotError::execution(
                "hotkey",
                format!("unknown key: {other}"),
            ))
        }
    };
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_marker_stripped_and_flagged() {
        assert_eq!(strip_submit_marker("hello\\n"), ("hello".into(), true));
        assert_eq!(strip_submit_marker("hello\n"), ("hello".into(), true));
        assert_eq!(strip_submit_marker("hello"), ("hello".into(), false));
        // both forms stacked still collapse to one submit
        assert_eq!(strip_submit_marker("hello\\n\n"), ("hello".into(), true));
        assert_eq!(strip_submit_marker("\\n"), (String::new(), true));
    }

    #[test]
    fn clipboard_needed_only_for_non_ascii() {
        assert!(!needs_clipboard("plain ascii 123"));
        assert!(needs_clipboard("你好"));
        assert!(needs_clipboard("naïve"));
    }

    #[test]
    fn key_combos_split_on_plus_and_space() {
        assert_eq!(split_key_combo("ctrl+shift+t"), vec!["ctrl", "shift", "t"]);
        assert_eq!(split_key_combo("Ctrl Alt Del"), vec!["ctrl", "alt", "del"]);
        assert!(split_key_combo("  ").is_empty());
    }

    #[test]
    fn unknown_key_token_rejected() {
        assert!(key_for_token("hyperdrive").is_err());
        assert!(key_for_token("a").is_ok());
        assert!(key_for_token("enter").is_ok());
    }
}
