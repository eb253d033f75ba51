//! Adapter around the external GPU admin tool
//!
//! The tool is an opaque executable. Its query output is free text; the only
//! place that text is interpreted is [`parse_query_output`], so everything
//! above this module sees either a `CcMode` or a classified error.

use async_trait::async_trait;
use ccm_core::{CcMode, Device, Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const CC_MODE_PHRASE: &str = "CC mode is ";

/// CC mode operations on a single device
#[async_trait]
pub trait ModeTool: Send + Sync {
    /// Query the device's current CC mode
    async fn query_mode(&self, device: &Device) -> Result<CcMode>;

    /// Switch the device to `mode` and reset it so the mode takes effect
    async fn set_mode_and_reset(&self, device: &Device, mode: CcMode) -> Result<()>;

    /// Reset the device
    async fn reset(&self, device: &Device) -> Result<()>;
}

/// Extract the CC mode from the tool's query output
pub fn parse_query_output(output: &str) -> Result<CcMode> {
    let start = output
        .find(CC_MODE_PHRASE)
        .ok_or_else(|| Error::parse(format!("no CC mode found in tool output: {}", output.trim())))?;

    let token: String = output[start + CC_MODE_PHRASE.len()..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if token.is_empty() {
        return Err(Error::parse("empty CC mode token in tool output"));
    }

    token.parse()
}

/// `ModeTool` backed by the GPU admin tool executable
#[derive(Debug, Clone)]
pub struct GpuAdminTool {
    path: PathBuf,
}

impl GpuAdminTool {
    /// Create an adapter for the tool at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Run the tool against one device; returns combined stdout/stderr
    async fn run(&self, device: &Device, args: &[String]) -> Result<String> {
        let mut command = Command::new(&self.path);
        command
            .arg(format!("--gpu-bdf={}", device.bus_id))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Running {} --gpu-bdf={} {:?}", self.path.display(), device.bus_id, args);

        let output = command.output().await.map_err(|e| {
            Error::apply(format!("failed to run {}: {}", self.path.display(), e))
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(Error::apply(format!(
                "{} failed on {} ({}): {}",
                self.path.display(),
                device.bus_id,
                output.status,
                combined.trim()
            )));
        }

        Ok(combined)
    }
}

#[async_trait]
impl ModeTool for GpuAdminTool {
    async fn query_mode(&self, device: &Device) -> Result<CcMode> {
        let output = self.run(device, &["--query-cc-mode".to_string()]).await?;
        parse_query_output(&output)
    }

    async fn set_mode_and_reset(&self, device: &Device, mode: CcMode) -> Result<()> {
        let args = [
            format!("--set-cc-mode={}", mode),
            "--reset-after-cc-mode-switch".to_string(),
        ];
        self.run(device, &args).await.map(|_| ())
    }

    async fn reset(&self, device: &Device) -> Result<()> {
        self.run(device, &["--reset-with-os".to_string()]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_output() {
        let output = "2024-03-01 10:00:00,000 INFO GPU 0000:41:00.0 H100-PCIE 0x2331 BAR0 0x0\n\
                      2024-03-01 10:00:01,000 INFO GPU 0000:41:00.0 H100-PCIE CC mode is on\n";
        assert_eq!(parse_query_output(output).unwrap(), CcMode::On);

        assert_eq!(parse_query_output("CC mode is devtools").unwrap(), CcMode::Devtools);
        assert_eq!(parse_query_output("... CC mode is off.").unwrap(), CcMode::Off);
    }

    #[test]
    fn test_parse_query_output_errors() {
        let err = parse_query_output("CC mode is protected-pcie").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        let err = parse_query_output("GPU not found").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        assert!(parse_query_output("").is_err());
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("gpu-tool");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_invocation() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let script = write_script(
            temp_dir.path(),
            r#"case "$2" in
  --query-cc-mode) echo "GPU $1 CC mode is devtools" ;;
  --set-cc-mode=*) exit 0 ;;
  *) echo "unsupported $2" >&2; exit 3 ;;
esac"#,
        );
        let tool = GpuAdminTool::new(&script);
        let device = Device::new("0000:41:00.0", 0x10de, 0x030200, 0x2331);

        assert_eq!(tool.query_mode(&device).await.unwrap(), CcMode::Devtools);
        assert!(tool.set_mode_and_reset(&device, CcMode::On).await.is_ok());

        let err = tool.reset(&device).await.unwrap_err();
        assert!(matches!(err, Error::Apply(ref msg) if msg.contains("unsupported")));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let tool = GpuAdminTool::new("/nonexistent/gpu-tool");
        let device = Device::new("0000:41:00.0", 0x10de, 0x030200, 0x2331);
        assert!(matches!(tool.query_mode(&device).await, Err(Error::Apply(_))));
    }
}
