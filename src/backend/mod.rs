//! Backend command builders.
//!
//! A builder turns a [`System`](crate::models::system::System) into the
//! [`CommandInvocation`] that boots it. Builders never spawn anything: the
//! caller owns the process, its working directory and its standard streams.

pub mod qemu;

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::process::Command;

/// Program, argument vector and extra environment for one boot process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Executable name or path.
    pub program: String,
    /// Arguments, excluding the program itself.
    pub args: Vec<String>,
    /// Environment variables added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Start an invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Append a flag followed by its value.
    pub fn flag(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.args.push(flag.to_owned());
        self.args.push(value.into());
        self
    }

    /// Full argument vector, program first.
    #[must_use]
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Whether `flag` is immediately followed by `value` anywhere in the args.
    #[must_use]
    pub fn has_flag(&self, flag: &str, value: &str) -> bool {
        self.args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    /// Value following the first occurrence of `flag`.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }

    /// Build a `tokio` command ready to spawn.
    ///
    /// The child is killed if its handle is dropped. Stdin is closed; stdout
    /// and stderr are inherited unless the caller overrides them.
    #[must_use]
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (OsStr::new(k), OsStr::new(v))))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}
