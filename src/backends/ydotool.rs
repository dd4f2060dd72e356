//! `ydotool` backend: uinput injection. Works under Wayland and on bare
//! consoles, but needs the `ydotoold` daemon and cannot read the cursor.

use async_trait::async_trait;
use serde_json::json;

use super::{
    unsupported, Backend, BackendError, MouseButton, Operation, Output, ProbeFailure, ProcessRunner,
};
use crate::types::{BackendId, OperationClass, Point};

const PROGRAM: &str = "ydotool";

/// Button flags for `ydotool click`.
const BUTTON_DOWN: u8 = 0x40;
const BUTTON_UP: u8 = 0x80;

pub struct YdotoolBackend {
    runner: ProcessRunner,
}

impl YdotoolBackend {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    async fn ydotool(&self, args: &[&str]) -> Result<(), BackendError> {
        self.runner.run_ok(PROGRAM, args).await.map(|_| ())
    }

    async fn move_to(&self, p: Point) -> Result<(), BackendError> {
        self.ydotool(&[
            "mousemove",
            "--absolute",
            "-x",
            &p.x.to_string(),
            "-y",
            &p.y.to_string(),
        ])
        .await
    }

    async fn button(&self, button: MouseButton, flags: u8) -> Result<(), BackendError> {
        let code = format!("0x{:02X}", flags | button_index(button));
        self.ydotool(&["click", &code]).await
    }
}

fn button_index(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 0x00,
        MouseButton::Right => 0x01,
        MouseButton::Middle => 0x02,
    }
}

/// Linux input event code for a key name.
pub(crate) fn keycode(key: &str) -> Option<u16> {
    let key = key.trim().to_lowercase();
    let code = match key.as_str() {
        "esc" | "escape" => 1,
        "backspace" => 14,
        "tab" => 15,
        "enter" | "return" => 28,
        "ctrl" | "control" => 29,
        "shift" => 42,
        "alt" => 56,
        "space" => 57,
        "capslock" => 58,
        "home" => 102,
        "up" => 103,
        "pageup" | "page_up" | "pgup" => 104,
        "left" => 105,
        "right" => 106,
        "end" => 107,
        "down" => 108,
        "pagedown" | "page_down" | "pgdn" => 109,
        "insert" => 110,
        "delete" | "del" => 111,
        "win" | "super" | "cmd" | "meta" => 125,
        "f11" => 87,
        "f12" => 88,
        _ => return single_char_keycode(&key).or_else(|| function_keycode(&key)),
    };
    Some(code)
}

fn single_char_keycode(key: &str) -> Option<u16> {
    let mut chars = key.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    const LETTERS: &str = "qwertyuiopasdfghjklzxcvbnm";
    const LETTER_CODES: [u16; 26] = [
        16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 30, 31, 32, 33, 34, 35, 36, 37, 38, 44, 45, 46,
        47, 48, 49, 50,
    ];
    if let Some(i) = LETTERS.find(c) {
        return Some(LETTER_CODES[i]);
    }
    match c {
        '1'..='9' => Some(2 + (c as u16 - '1' as u16)),
        '0' => Some(11),
        _ => None,
    }
}

fn function_keycode(key: &str) -> Option<u16> {
    let n: u16 = key.strip_prefix('f')?.parse().ok()?;
    (1..=10).contains(&n).then_some(58 + n)
}

fn resolve_keycode(key: &str) -> Result<u16, BackendError> {
    keycode(key).ok_or_else(|| BackendError(format!("ydotool has no keycode for '{}'", key)))
}

#[async_trait]
impl Backend for YdotoolBackend {
    fn id(&self) -> BackendId {
        BackendId::Ydotool
    }

    fn supports(&self, class: OperationClass) -> bool {
        matches!(class, OperationClass::Mouse | OperationClass::Keyboard)
    }

    async fn probe(&self, class: OperationClass) -> Result<(), ProbeFailure> {
        match class {
            // No readback is possible; a zero relative move proves the
            // daemon accepts events.
            OperationClass::Mouse => {
                self.runner
                    .probe(PROGRAM, &["mousemove", "-x", "0", "-y", "0"])
                    .await?;
                Ok(())
            }
            OperationClass::Keyboard => {
                self.runner.probe(PROGRAM, &["key", "42:0"]).await?;
                Ok(())
            }
            other => Err(ProbeFailure::invalid_result(format!(
                "ydotool does not serve {}",
                other
            ))),
        }
    }

    async fn execute(&self, op: Operation) -> Result<Output, BackendError> {
        match op {
            Operation::Click { at, button, clicks } => {
                if let Some(p) = at {
                    self.move_to(p).await?;
                }
                for _ in 0..clicks.max(1) {
                    self.button(button, BUTTON_DOWN | BUTTON_UP).await?;
                }
                Ok(Output::Done(json!({
                    "x": at.map(|p| p.x),
                    "y": at.map(|p| p.y),
                    "button": button,
                    "clicks": clicks.max(1),
                })))
            }
            Operation::MoveTo { to } => {
                self.move_to(to).await?;
                Ok(Output::Done(json!({"x": to.x, "y": to.y})))
            }
            Operation::Scroll {
                at,
                direction,
                clicks,
            } => {
                use super::ScrollDirection::*;
                if let Some(p) = at {
                    self.move_to(p).await?;
                }
                let n = clicks.max(1) as i64;
                let (dx, dy) = match direction {
                    Up => (0, n),
                    Down => (0, -n),
                    Left => (-n, 0),
                    Right => (n, 0),
                };
                self.ydotool(&[
                    "mousemove",
                    "--wheel",
                    "-x",
                    &dx.to_string(),
                    "-y",
                    &dy.to_string(),
                ])
                .await?;
                Ok(Output::Done(json!({"direction": direction, "clicks": n})))
            }
            Operation::Drag { from, to, button } => {
                self.move_to(from).await?;
                self.button(button, BUTTON_DOWN).await?;
                let moved = self.move_to(to).await;
                self.button(button, BUTTON_UP).await?;
                moved?;
                Ok(Output::Done(json!({"from": from, "to": to, "button": button})))
            }
            Operation::TypeText { text, interval_ms } => {
                let delay = interval_ms.to_string();
                self.ydotool(&["type", "-d", &delay, "--", &text]).await?;
                Ok(Output::Done(json!({"characters": text.chars().count()})))
            }
            Operation::PressKey { key, presses } => {
                let code = resolve_keycode(&key)?;
                let (down, up) = (format!("{}:1", code), format!("{}:0", code));
                for _ in 0..presses.max(1) {
                    self.ydotool(&["key", &down, &up]).await?;
                }
                Ok(Output::Done(json!({"key": key, "presses": presses.max(1)})))
            }
            Operation::KeyCombo { keys } => {
                let codes = keys
                    .iter()
                    .map(|k| resolve_keycode(k))
                    .collect::<Result<Vec<_>, _>>()?;
                // Press in order, release in reverse.
                let mut events: Vec<String> = codes.iter().map(|c| format!("{}:1", c)).collect();
                events.extend(codes.iter().rev().map(|c| format!("{}:0", c)));
                let mut args = vec!["key"];
                args.extend(events.iter().map(String::as_str));
                self.ydotool(&args).await?;
                Ok(Output::Done(json!({"keys": keys})))
            }
            Operation::KeyUp { key } => {
                let up = format!("{}:0", resolve_keycode(&key)?);
                self.ydotool(&["key", &up]).await?;
                Ok(Output::Done(json!({"key": key})))
            }
            other => Err(unsupported(self.id(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keycodes() {
        assert_eq!(keycode("a"), Some(30));
        assert_eq!(keycode("C"), Some(46));
        assert_eq!(keycode("1"), Some(2));
        assert_eq!(keycode("0"), Some(11));
        assert_eq!(keycode("F5"), Some(63));
        assert_eq!(keycode("enter"), Some(28));
        assert_eq!(keycode("ctrl"), Some(29));
        assert_eq!(keycode("§"), None);
    }

    #[test]
    fn test_click_code_combines_flags() {
        let code = format!("0x{:02X}", BUTTON_DOWN | BUTTON_UP | button_index(MouseButton::Left));
        assert_eq!(code, "0xC0");
    }
}
