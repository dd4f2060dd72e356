//! `wmctrl` backend for EWMH window management.

use async_trait::async_trait;
use serde_json::json;

use super::{unsupported, Backend, BackendError, Operation, Output, ProbeFailure, ProcessRunner};
use crate::types::{BackendId, OperationClass, WindowInfo};

const PROGRAM: &str = "wmctrl";

pub struct WmctrlBackend {
    runner: ProcessRunner,
}

impl WmctrlBackend {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    async fn wmctrl(&self, args: &[&str]) -> Result<(), BackendError> {
        self.runner.run_ok(PROGRAM, args).await.map(|_| ())
    }
}

/// Parse `wmctrl -lG` output:
/// `<id> <desktop> <x> <y> <w> <h> <host> <title...>`.
pub(crate) fn parse_window_list(output: &str) -> Option<Vec<WindowInfo>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.to_string();
            let desktop: i32 = fields.next()?.parse().ok()?;
            let x = fields.next()?.parse().ok()?;
            let y = fields.next()?.parse().ok()?;
            let width = fields.next()?.parse().ok()?;
            let height = fields.next()?.parse().ok()?;
            let _host = fields.next()?;
            let title = fields.collect::<Vec<_>>().join(" ");
            Some(WindowInfo {
                id,
                title,
                x,
                y,
                width,
                height,
                desktop: Some(desktop),
            })
        })
        .collect()
}

#[async_trait]
impl Backend for WmctrlBackend {
    fn id(&self) -> BackendId {
        BackendId::Wmctrl
    }

    fn supports(&self, class: OperationClass) -> bool {
        class == OperationClass::Window
    }

    async fn probe(&self, _class: OperationClass) -> Result<(), ProbeFailure> {
        let output = self.runner.probe(PROGRAM, &["-lG"]).await?;
        parse_window_list(&output.stdout_str())
            .map(|_| ())
            .ok_or_else(|| ProbeFailure::invalid_result("unparseable wmctrl -lG output"))
    }

    async fn execute(&self, op: Operation) -> Result<Output, BackendError> {
        match op {
            Operation::ListWindows => {
                let output = self.runner.run_ok(PROGRAM, &["-lG"]).await?;
                let windows = parse_window_list(&output.stdout_str())
                    .ok_or_else(|| BackendError::new("unparseable wmctrl -lG output"))?;
                Ok(Output::Windows(windows))
            }
            Operation::ActivateWindow { title } => {
                self.wmctrl(&["-a", &title]).await?;
                Ok(Output::Done(json!({"title": title})))
            }
            Operation::ResizeWindow {
                title,
                width,
                height,
            } => {
                let geometry = format!("0,-1,-1,{},{}", width, height);
                self.wmctrl(&["-r", &title, "-e", &geometry]).await?;
                Ok(Output::Done(json!({"title": title, "width": width, "height": height})))
            }
            Operation::MoveWindow { title, x, y } => {
                let geometry = format!("0,{},{},-1,-1", x, y);
                self.wmctrl(&["-r", &title, "-e", &geometry]).await?;
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
    fn test_parse_window_list() {
        let out = "0x03c00003  0 100  200  800  600  host Firefox - Start Page\n\
                   0x04200001 -1 0    0    1920 32   host panel\n";
        let windows = parse_window_list(out).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].title, "Firefox - Start Page");
        assert_eq!((windows[0].x, windows[0].width), (100, 800));
        assert_eq!(windows[1].desktop, Some(-1));
    }

    #[test]
    fn test_parse_window_list_rejects_garbage() {
        assert!(parse_window_list("not a window list").is_none());
        assert_eq!(parse_window_list("").map(|w| w.len()), Some(0));
    }
}
