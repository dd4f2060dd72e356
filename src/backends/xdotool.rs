//! `xdotool` backend: XTest mouse and keyboard injection plus basic window
//! management through EWMH.

use async_trait::async_trait;
use serde_json::json;

use super::{
    shell_vars, unsupported, Backend, BackendError, Operation, Output, ProbeFailure, ProcessRunner,
};
use crate::types::{BackendId, OperationClass, Point, WindowInfo};

const PROGRAM: &str = "xdotool";

pub struct XdotoolBackend {
    runner: ProcessRunner,
}

impl XdotoolBackend {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    async fn xdotool(&self, args: &[&str]) -> Result<String, BackendError> {
        Ok(self.runner.run_ok(PROGRAM, args).await?.stdout_str())
    }

    async fn move_to(&self, p: Point) -> Result<(), BackendError> {
        self.xdotool(&["mousemove", "--sync", &p.x.to_string(), &p.y.to_string()])
            .await
            .map(|_| ())
    }

    async fn cursor(&self) -> Result<Point, ProbeFailure> {
        let output = self
            .runner
            .probe(PROGRAM, &["getmouselocation", "--shell"])
            .await?;
        parse_location(&output.stdout_str()).ok_or_else(|| {
            ProbeFailure::invalid_result("getmouselocation returned no coordinates")
        })
    }

    async fn location(&self) -> Result<Point, BackendError> {
        let output = self.xdotool(&["getmouselocation", "--shell"]).await?;
        parse_location(&output)
            .ok_or_else(|| BackendError("getmouselocation returned no coordinates".to_string()))
    }

    /// First window whose title matches `title`.
    async fn find_window(&self, title: &str) -> Result<String, BackendError> {
        let output = self
            .runner
            .run(PROGRAM, &["search", "--limit", "1", "--name", title])
            .await?;
        output
            .stdout_str()
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BackendError(format!("No window matching '{}'", title)))
    }

    async fn list_windows(&self) -> Result<Vec<WindowInfo>, BackendError> {
        // `search` exits 1 when nothing matches, which is an empty desktop.
        let output = self
            .runner
            .run(PROGRAM, &["search", "--onlyvisible", "--name", "."])
            .await?;
        if !output.success() && !output.stderr.trim().is_empty() {
            return Err(BackendError(format!(
                "xdotool search failed: {}",
                output.stderr.trim()
            )));
        }

        let mut windows = Vec::new();
        for id in output.stdout_str().lines().map(str::trim).filter(|l| !l.is_empty()) {
            let title = self.xdotool(&["getwindowname", id]).await?;
            let geometry = shell_vars(&self.xdotool(&["getwindowgeometry", "--shell", id]).await?);
            let field = |k: &str| geometry.get(k).and_then(|v| v.parse::<i64>().ok());
            windows.push(WindowInfo {
                id: id.to_string(),
                title: title.trim().to_string(),
                x: field("X").unwrap_or(0) as i32,
                y: field("Y").unwrap_or(0) as i32,
                width: field("WIDTH").unwrap_or(0).max(0) as u32,
                height: field("HEIGHT").unwrap_or(0).max(0) as u32,
                desktop: None,
            });
        }
        Ok(windows)
    }
}

fn parse_location(output: &str) -> Option<Point> {
    let vars = shell_vars(output);
    let x = vars.get("X")?.parse().ok()?;
    let y = vars.get("Y")?.parse().ok()?;
    Some(Point::new(x, y))
}

/// Map common key names onto X keysym names.
pub(crate) fn keysym(key: &str) -> String {
    let lower = key.trim().to_lowercase();
    let mapped = match lower.as_str() {
        "enter" | "return" => "Return",
        "esc" | "escape" => "Escape",
        "tab" => "Tab",
        "space" => "space",
        "backspace" => "BackSpace",
        "delete" | "del" => "Delete",
        "insert" => "Insert",
        "home" => "Home",
        "end" => "End",
        "pageup" | "page_up" | "pgup" => "Prior",
        "pagedown" | "page_down" | "pgdn" => "Next",
        "up" => "Up",
        "down" => "Down",
        "left" => "Left",
        "right" => "Right",
        "ctrl" | "control" => "ctrl",
        "alt" => "alt",
        "shift" => "shift",
        "win" | "super" | "cmd" | "meta" => "super",
        "capslock" => "Caps_Lock",
        _ => {
            if lower.len() > 1 && lower.starts_with('f') && lower[1..].parse::<u8>().is_ok() {
                return lower.to_uppercase();
            }
            return key.trim().to_string();
        }
    };
    mapped.to_string()
}

#[async_trait]
impl Backend for XdotoolBackend {
    fn id(&self) -> BackendId {
        BackendId::Xdotool
    }

    fn supports(&self, class: OperationClass) -> bool {
        matches!(
            class,
            OperationClass::Mouse | OperationClass::Keyboard | OperationClass::Window
        )
    }

    async fn probe(&self, class: OperationClass) -> Result<(), ProbeFailure> {
        match class {
            OperationClass::Mouse => {
                let before = self.cursor().await?;
                self.runner
                    .probe(
                        PROGRAM,
                        &["mousemove", "--sync", &before.x.to_string(), &before.y.to_string()],
                    )
                    .await?;
                let after = self.cursor().await?;
                if before != after {
                    return Err(ProbeFailure::invalid_result(format!(
                        "cursor read back at ({}, {}) after move to ({}, {})",
                        after.x, after.y, before.x, before.y
                    )));
                }
                Ok(())
            }
            OperationClass::Keyboard => {
                self.runner.probe(PROGRAM, &["keyup", "shift"]).await?;
                Ok(())
            }
            OperationClass::Window => {
                let output = self
                    .runner
                    .run(PROGRAM, &["search", "--onlyvisible", "--name", "."])
                    .await?;
                if !output.success() && !output.stderr.trim().is_empty() {
                    return Err(ProbeFailure::from_stderr(PROGRAM, &output.stderr));
                }
                let parseable = output
                    .stdout_str()
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .all(|l| l.parse::<u64>().is_ok());
                if !parseable {
                    return Err(ProbeFailure::invalid_result("unexpected window id list"));
                }
                Ok(())
            }
            OperationClass::Capture | OperationClass::Ocr => Err(ProbeFailure::invalid_result(
                format!("xdotool does not serve {}", class),
            )),
        }
    }

    async fn execute(&self, op: Operation) -> Result<Output, BackendError> {
        match op {
            Operation::Click { at, button, clicks } => {
                if let Some(p) = at {
                    self.move_to(p).await?;
                }
                let repeat = clicks.max(1).to_string();
                let code = button.x11_code().to_string();
                self.xdotool(&["click", "--repeat", &repeat, &code]).await?;
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
                if let Some(p) = at {
                    self.move_to(p).await?;
                }
                let repeat = clicks.max(1).to_string();
                let code = direction.x11_button().to_string();
                self.xdotool(&["click", "--repeat", &repeat, &code]).await?;
                Ok(Output::Done(json!({
                    "direction": direction,
                    "clicks": clicks.max(1),
                })))
            }
            Operation::Drag { from, to, button } => {
                let code = button.x11_code().to_string();
                self.move_to(from).await?;
                self.xdotool(&["mousedown", &code]).await?;
                let moved = self.move_to(to).await;
                // Always release, even if the move failed.
                self.xdotool(&["mouseup", &code]).await?;
                moved?;
                Ok(Output::Done(json!({
                    "from": from,
                    "to": to,
                    "button": button,
                })))
            }
            Operation::CursorPosition => {
                let p = self.location().await?;
                Ok(Output::Done(json!({"x": p.x, "y": p.y})))
            }
            Operation::TypeText { text, interval_ms } => {
                let delay = interval_ms.to_string();
                self.xdotool(&["type", "--delay", &delay, "--", &text]).await?;
                Ok(Output::Done(json!({"characters": text.chars().count()})))
            }
            Operation::PressKey { key, presses } => {
                let repeat = presses.max(1).to_string();
                let sym = keysym(&key);
                self.xdotool(&["key", "--repeat", &repeat, &sym]).await?;
                Ok(Output::Done(json!({"key": key, "presses": presses.max(1)})))
            }
            Operation::KeyCombo { keys } => {
                let combo = keys.iter().map(|k| keysym(k)).collect::<Vec<_>>().join("+");
                self.xdotool(&["key", &combo]).await?;
                Ok(Output::Done(json!({"keys": keys})))
            }
            Operation::KeyUp { key } => {
                self.xdotool(&["keyup", &keysym(&key)]).await?;
                Ok(Output::Done(json!({"key": key})))
            }
            Operation::ListWindows => Ok(Output::Windows(self.list_windows().await?)),
            Operation::ActivateWindow { title } => {
                let id = self.find_window(&title).await?;
                self.xdotool(&["windowactivate", "--sync", &id]).await?;
                Ok(Output::Done(json!({"title": title, "window_id": id})))
            }
            Operation::ResizeWindow {
                title,
                width,
                height,
            } => {
                let id = self.find_window(&title).await?;
                self.xdotool(&["windowsize", &id, &width.to_string(), &height.to_string()])
                    .await?;
                Ok(Output::Done(json!({"title": title, "width": width, "height": height})))
            }
            Operation::MoveWindow { title, x, y } => {
                let id = self.find_window(&title).await?;
                self.xdotool(&["windowmove", &id, &x.to_string(), &y.to_string()])
                    .await?;
                Ok(Output::Done(json!({"title": title, "x": x, "y": y})))
            }
            other => Err(unsupported(self.id(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let out = "X=960\nY=540\nSCREEN=0\nWINDOW=4194311\n";
        assert_eq!(parse_location(out), Some(Point::new(960, 540)));
        assert_eq!(parse_location("garbage"), None);
    }

    #[test]
    fn test_keysym_names() {
        assert_eq!(keysym("enter"), "Return");
        assert_eq!(keysym("Ctrl"), "ctrl");
        assert_eq!(keysym("f5"), "F5");
        assert_eq!(keysym("a"), "a");
        assert_eq!(keysym("pagedown"), "Next");
    }
}
