//! The external sandbox runtime, described as an argv template.
//!
//! The runtime is opaque: it is handed a staged directory and produces stdout, stderr and an exit
//! code. Placeholders expanded in every argument:
//!
//! - `{dir}`: absolute path of the staged directory
//! - `{entry}`: entry file name inside it
//! - `{language}`: language name (`python`, `cpp`, `java`)
//! - `{run}`: run id

use std::process::Stdio;

use tokio::process::Command;

use crate::language::Language;
use crate::staging::StagedDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRuntime {
    pub program: String,
    pub args: Vec<String>,
    /// Issued after a forced kill to tear down anything the runtime left behind.
    pub stop_args: Option<Vec<String>>,
}

impl SandboxRuntime {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stop_args: None,
        }
    }

    pub fn with_stop_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stop_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// One container per run: no network, staged directory mounted read/write at `/code`.
    pub fn docker(bin: &str, image_prefix: &str) -> Self {
        let image = format!("{}{{language}}", image_prefix);
        Self::new(
            bin,
            [
                "run",
                "-i",
                "--rm",
                "--network=none",
                "--name",
                "codebridge-{run}",
                "-v",
                "{dir}:/code",
                "--workdir",
                "/code",
                image.as_str(),
            ],
        )
        .with_stop_args(["rm", "-f", "codebridge-{run}"])
    }

    /// Command that runs the staged program, with all three standard streams piped.
    ///
    /// The child leads its own process group so a forced kill reaches everything it spawned.
    pub fn command(&self, staged: &StagedDir, language: Language, run_id: &str) -> Command {
        let vars = Vars { staged, language, run_id };
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|arg| vars.expand(arg)))
            .current_dir(staged.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }

    pub fn stop_command(&self, staged: &StagedDir, language: Language, run_id: &str) -> Option<Command> {
        let stop_args = self.stop_args.as_ref()?;
        let vars = Vars { staged, language, run_id };
        let mut cmd = Command::new(&self.program);
        cmd.args(stop_args.iter().map(|arg| vars.expand(arg)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Some(cmd)
    }

    /// Argument list after placeholder expansion, for logging and tests.
    pub fn expanded_args(&self, staged: &StagedDir, language: Language, run_id: &str) -> Vec<String> {
        let vars = Vars { staged, language, run_id };
        self.args.iter().map(|arg| vars.expand(arg)).collect()
    }
}

struct Vars<'a> {
    staged: &'a StagedDir,
    language: Language,
    run_id: &'a str,
}

impl Vars<'_> {
    fn expand(&self, template: &str) -> String {
        template
            .replace("{dir}", &self.staged.path().to_string_lossy())
            .replace("{entry}", self.staged.entry_file())
            .replace("{language}", self.language.as_str())
            .replace("{run}", self.run_id)
    }
}
