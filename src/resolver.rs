//! Turns an agent source into the command that runs it.
//!
//! Interpreted sources are handed to their interpreter, compiled sources are built next to the
//! source file first, anything else is executed directly.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{bail, Context};
use tracing::{error, instrument, trace};

/// A ready-to-spawn command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    /// Program to execute.
    pub program: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Working directory, if it matters.
    pub cwd: Option<PathBuf>,
}

impl ResolvedCommand {
    /// A command without a working directory.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
        }
    }
}

/// Maps an agent source to an executable command. May compile as a side effect.
pub trait CommandResolver: Send + Sync {
    /// Resolves `source`. Errors are treated as setup failures of the agent.
    fn resolve(&self, source: &Path) -> anyhow::Result<ResolvedCommand>;
}

/// Resolution by file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionResolver;

impl CommandResolver for ExtensionResolver {
    #[instrument(skip(self))]
    fn resolve(&self, source: &Path) -> anyhow::Result<ResolvedCommand> {
        if !source.is_file() {
            bail!("agent source {} does not exist", source.display());
        }
        let path = source.display().to_string();
        let ext = source.extension().and_then(OsStr::to_str).unwrap_or_default();

        let command = match ext {
            "py" => ResolvedCommand::new("python3", vec![path]),
            "js" => ResolvedCommand::new("node", vec![path]),
            "sh" => ResolvedCommand::new("sh", vec![path]),
            "rb" => ResolvedCommand::new("ruby", vec![path]),
            "php" => ResolvedCommand::new("php", vec![path]),
            "java" => {
                let dir = parent_dir(source);
                compile("javac", &[path.as_str()], &dir)?;
                let class = source
                    .file_stem()
                    .and_then(OsStr::to_str)
                    .context("java source has no class name")?;
                ResolvedCommand {
                    program: "java".into(),
                    args: vec!["-cp".into(), dir.display().to_string(), class.into()],
                    cwd: Some(dir),
                }
            }
            "c" | "cpp" | "cc" => {
                let compiler = if ext == "c" { "gcc" } else { "g++" };
                let binary = binary_path(source);
                let out = binary.display().to_string();
                compile(compiler, &["-O2", "-o", out.as_str(), path.as_str()], &parent_dir(source))?;
                ResolvedCommand::new(out, vec![])
            }
            "go" => {
                let binary = binary_path(source);
                let out = binary.display().to_string();
                compile("go", &["build", "-o", out.as_str(), path.as_str()], &parent_dir(source))?;
                ResolvedCommand::new(out, vec![])
            }
            _ => ResolvedCommand::new(path, vec![]),
        };
        trace!(?command);
        Ok(command)
    }
}

fn parent_dir(source: &Path) -> PathBuf {
    match source.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn binary_path(source: &Path) -> PathBuf {
    source.with_extension("out")
}

fn compile(compiler: &str, args: &[&str], dir: &Path) -> anyhow::Result<()> {
    let output = std::process::Command::new(compiler)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("could not launch command '{compiler}'"))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    error!("compilation error: {stderr}");
    bail!(
        "compilation error: {}",
        stderr.lines().next().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_interpreted_sources() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("bot.py");
        std::fs::write(&script, "print('R')\n").unwrap();

        let cmd = ExtensionResolver.resolve(&script).unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec![script.display().to_string()]);
    }

    #[test]
    fn unknown_extension_runs_file_directly() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("bot");
        std::fs::write(&exe, "").unwrap();

        let cmd = ExtensionResolver.resolve(&exe).unwrap();
        assert_eq!(cmd.program, exe.display().to_string());
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn missing_source_is_an_error() {
        let err = ExtensionResolver
            .resolve(Path::new("/definitely/not/here.sh"))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
