//! Screenshot backends: `scrot`, `grim` and ImageMagick `import`.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{
    unsupported, Backend, BackendError, CommandOutput, Operation, Output, ProbeFailure,
    ProcessRunner, RunError,
};
use crate::types::{BackendId, Image, OperationClass, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureTool {
    Scrot,
    Grim,
    Import,
}

/// One screenshot helper. All three produce PNG.
pub struct CaptureBackend {
    tool: CaptureTool,
    runner: ProcessRunner,
}

impl CaptureBackend {
    pub fn scrot(runner: ProcessRunner) -> Self {
        Self {
            tool: CaptureTool::Scrot,
            runner,
        }
    }

    pub fn grim(runner: ProcessRunner) -> Self {
        Self {
            tool: CaptureTool::Grim,
            runner,
        }
    }

    pub fn import(runner: ProcessRunner) -> Self {
        Self {
            tool: CaptureTool::Import,
            runner,
        }
    }

    fn program(&self) -> &'static str {
        match self.tool {
            CaptureTool::Scrot => "scrot",
            CaptureTool::Grim => "grim",
            CaptureTool::Import => "import",
        }
    }

    /// Run the helper and collect the PNG bytes it produced.
    async fn grab(&self, region: Option<Rect>) -> Result<(CommandOutput, Vec<u8>), RunError> {
        let program = self.program();
        match self.tool {
            CaptureTool::Scrot => {
                // scrot cannot write to stdout.
                let path = temp_png_path();
                let path_str = path.to_string_lossy().to_string();
                let area = region.map(|r| format!("{},{},{},{}", r.x, r.y, r.width, r.height));
                let mut args = vec!["-o"];
                if let Some(area) = &area {
                    args.extend(["-a", area.as_str()]);
                }
                args.push(&path_str);

                let output = self.runner.run(program, &args).await?;
                let bytes = tokio::fs::read(&path).await.unwrap_or_default();
                let _ = tokio::fs::remove_file(&path).await;
                Ok((output, bytes))
            }
            CaptureTool::Grim => {
                let geometry = region.map(|r| format!("{},{} {}x{}", r.x, r.y, r.width, r.height));
                let mut args = vec!["-t", "png"];
                if let Some(geometry) = &geometry {
                    args.extend(["-g", geometry.as_str()]);
                }
                args.push("-");
                let output = self.runner.run(program, &args).await?;
                let bytes = output.stdout.clone();
                Ok((output, bytes))
            }
            CaptureTool::Import => {
                let crop = region.map(|r| format!("{}x{}{:+}{:+}", r.width, r.height, r.x, r.y));
                let mut args = vec!["-window", "root"];
                if let Some(crop) = &crop {
                    args.extend(["-crop", crop.as_str(), "+repage"]);
                }
                args.push("png:-");
                let output = self.runner.run(program, &args).await?;
                let bytes = output.stdout.clone();
                Ok((output, bytes))
            }
        }
    }
}

fn temp_png_path() -> PathBuf {
    std::env::temp_dir().join(format!("lilith-capture-{}.png", uuid::Uuid::new_v4()))
}

#[async_trait]
impl Backend for CaptureBackend {
    fn id(&self) -> BackendId {
        match self.tool {
            CaptureTool::Scrot => BackendId::Scrot,
            CaptureTool::Grim => BackendId::Grim,
            CaptureTool::Import => BackendId::Import,
        }
    }

    fn supports(&self, class: OperationClass) -> bool {
        class == OperationClass::Capture
    }

    async fn probe(&self, _class: OperationClass) -> Result<(), ProbeFailure> {
        let (output, bytes) = self.grab(None).await?;
        if !output.success() {
            return Err(ProbeFailure::from_stderr(self.program(), &output.stderr));
        }
        Image::from_png(bytes).map(|_| ()).ok_or_else(|| {
            ProbeFailure::invalid_result(format!("{} produced no decodable frame", self.program()))
        })
    }

    async fn execute(&self, op: Operation) -> Result<Output, BackendError> {
        let Operation::Capture { region } = op else {
            return Err(unsupported(self.id(), &op));
        };

        let (output, bytes) = self.grab(region).await?;
        if !output.success() {
            return Err(BackendError(format!(
                "{} failed: {}",
                self.program(),
                output.stderr.trim()
            )));
        }
        let image = Image::from_png(bytes)
            .ok_or_else(|| BackendError(format!("{} produced an invalid PNG", self.program())))?;

        tracing::debug!(
            backend = %self.id(),
            width = image.width,
            height = image.height,
            "Captured screen"
        );
        Ok(Output::Image(image))
    }
}
