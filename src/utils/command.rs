/// Helpers for running external CLIs such as `kind`
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured output of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }

    /// Stdout on success, otherwise an error carrying stderr
    pub fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{}", self.stderr.trim())
        }
    }
}

/// Builder for one external command invocation
pub struct CommandBuilder {
    command: Command,
    stdin: Option<Vec<u8>>,
    context_msg: Option<String>,
}

impl CommandBuilder {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut command = Command::new(program);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Self {
            command,
            stdin: None,
            context_msg: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.command.env(key, val);
        self
    }

    /// Set KUBECONFIG environment variable
    pub fn kubeconfig(self, path: &Path) -> Self {
        self.env("KUBECONFIG", path)
    }

    /// Feed `input` to the command's stdin
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.command.stdin(Stdio::piped());
        self.stdin = Some(input.into());
        self
    }

    /// Set context message for error reporting
    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// Execute and return raw output
    pub async fn output(mut self) -> Result<CommandOutput> {
        let context = self
            .context_msg
            .take()
            .unwrap_or_else(|| format!("failed to run {:?}", self.command.as_std().get_program()));

        let mut child = self.command.spawn().context(context.clone())?;
        if let Some(input) = self.stdin.take() {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&input).await.context(context.clone())?;
                // Closing stdin lets the command see EOF.
                drop(pipe);
            }
        }

        let output = child.wait_with_output().await.context(context)?;
        Ok(CommandOutput::from_output(output))
    }

    /// Execute and return stdout on success, error on failure
    pub async fn run(self) -> Result<String> {
        self.output().await?.into_result()
    }

    /// Execute and only check for success
    pub async fn run_silent(self) -> Result<()> {
        self.output().await?.into_result().map(|_| ())
    }
}

/// Check if a command-line tool is installed
pub async fn check_tool_installed(
    tool_name: &str,
    version_args: &[&str],
    install_url: &str,
) -> Result<()> {
    let output = CommandBuilder::new(tool_name)
        .args(version_args)
        .output()
        .await;

    match output {
        Ok(out) if out.success => Ok(()),
        _ => anyhow::bail!(
            "{} is not installed or not in PATH. Please install from {}",
            tool_name,
            install_url
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_builder_env() {
        let output = CommandBuilder::new("sh")
            .arg("-c")
            .arg("echo $KIND_CLUSTER_NAME")
            .env("KIND_CLUSTER_NAME", "kind-example")
            .output()
            .await
            .unwrap();

        assert!(output.success);
        assert!(output.stdout.contains("kind-example"));
    }

    #[tokio::test]
    async fn test_command_builder_stdin() {
        let stdout = CommandBuilder::new("cat")
            .stdin("kind: Cluster\n")
            .context("piping config into cat")
            .run()
            .await
            .unwrap();

        assert_eq!(stdout, "kind: Cluster\n");
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let err = CommandBuilder::new("sh")
            .args(["-c", "echo 'no nodes found' >&2; exit 1"])
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "no nodes found");
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let result =
            check_tool_installed("kindling-no-such-tool", &["version"], "https://kind.sigs.k8s.io").await;
        assert!(result.is_err());
    }
}
