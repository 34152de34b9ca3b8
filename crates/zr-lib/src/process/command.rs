use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    process::Stdio,
};

/// A builder for the subprocesses the executor spawns. Task commands
/// always go through the platform shell.
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<OsString>,
    env: BTreeMap<OsString, OsString>,
    label: String,
}

impl Command {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        let program = program.as_ref().to_os_string();
        let label = program.to_string_lossy().into_owned();
        Self {
            program,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            label,
        }
    }

    /// A command that runs `script` through the platform shell:
    /// `sh -c` on unix, `cmd /C` on windows.
    pub fn shell(script: impl AsRef<str>) -> Self {
        let script = script.as_ref();
        let mut command = if cfg!(windows) {
            let mut command = Command::new("cmd");
            command.args(["/C", script]);
            command
        } else {
            let mut command = Command::new("sh");
            command.args(["-c", script]);
            command
        };
        command.label = script.to_string();
        command
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();
        self
    }

    pub fn current_dir(&mut self, dir: impl AsRef<OsStr>) -> &mut Self {
        self.cwd = Some(dir.as_ref().to_os_string());
        self
    }

    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (ref key, ref val) in vars {
            self.env
                .insert(key.as_ref().to_os_string(), val.as_ref().to_os_string());
        }
        self
    }

    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env
            .insert(key.as_ref().to_os_string(), val.as_ref().to_os_string());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl From<Command> for tokio::process::Command {
    fn from(value: Command) -> Self {
        let Command {
            program,
            args,
            cwd,
            env,
            ..
        } = value;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(env)
            // Task output flows straight through to the user's terminal
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .stdin(Stdio::null());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}
