//! Launch description for child processes.

use std::path::{Path, PathBuf};

/// Everything needed to start a child process.
///
/// Built by engine launchers and the restart protocol, consumed by a
/// [`ProcessBackend`](crate::ports::ProcessBackend). Redirect targets are
/// files; the backend creates them (and their parents) and appends to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            stdout: None,
            stderr: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Send both stdout and stderr to the same file.
    #[must_use]
    pub fn log_to(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self.stderr = Some(path.to_path_buf());
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_args_and_redirects() {
        let cmd = LaunchCommand::new("/opt/llama-server")
            .args(["-m", "/models/a.gguf"])
            .arg("--jinja")
            .env("CUDA_VISIBLE_DEVICES", "0")
            .log_to(Path::new("/tmp/a.log"));

        assert_eq!(cmd.args, vec!["-m", "/models/a.gguf", "--jinja"]);
        assert_eq!(cmd.stdout, cmd.stderr);
        assert_eq!(cmd.display(), "/opt/llama-server -m /models/a.gguf --jinja");
    }
}
