//! Command line builder.
//!
//! Builds command lines for the shell of a host so that role code does not
//! have to care whether options are spelled `--name` (bash) or `-Name`
//! (PowerShell).
//!
//! ```rust,ignore
//! let cli = host.base().cli();
//! let args = CliArgs::new()
//!     .value("home", "/home/jdoe")
//!     .value("password", None::<String>)
//!     .switch("enabled", true)
//!     .positional("login", "jdoe");
//!
//! // add-user --home '/home/jdoe' --enabled 'jdoe'
//! host.conn().run(&cli.command("add-user", &args), RunOptions::new()).await?;
//! ```

use indexmap::IndexMap;

use crate::connection::Shell;

/// How an argument is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliOption {
    /// `--name value`, value never quoted
    Plain,
    /// `--name value`, value quoted in script mode
    Value,
    /// `--name` if true (`-Name:$True` / `-Name:$False` in PowerShell)
    Switch,
    /// Value without option name
    Positional,
}

/// Argument value. [`CliValue::Unset`] arguments are left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliValue {
    /// No value
    Unset,
    /// Boolean, used by switches
    Bool(bool),
    /// Single value
    One(String),
    /// Repeated option, one occurrence per value
    List(Vec<String>),
}

impl CliValue {
    fn values(&self) -> Vec<String> {
        match self {
            CliValue::Unset => Vec::new(),
            CliValue::Bool(b) => vec![b.to_string()],
            CliValue::One(v) => vec![v.clone()],
            CliValue::List(list) => list.clone(),
        }
    }
}

impl From<&str> for CliValue {
    fn from(value: &str) -> Self {
        CliValue::One(value.to_string())
    }
}

impl From<String> for CliValue {
    fn from(value: String) -> Self {
        CliValue::One(value)
    }
}

impl From<bool> for CliValue {
    fn from(value: bool) -> Self {
        CliValue::Bool(value)
    }
}

impl From<i64> for CliValue {
    fn from(value: i64) -> Self {
        CliValue::One(value.to_string())
    }
}

impl From<Vec<String>> for CliValue {
    fn from(value: Vec<String>) -> Self {
        CliValue::List(value)
    }
}

impl From<Vec<&str>> for CliValue {
    fn from(value: Vec<&str>) -> Self {
        CliValue::List(value.into_iter().map(String::from).collect())
    }
}

impl<T: Into<CliValue>> From<Option<T>> for CliValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CliValue::Unset)
    }
}

/// Ordered command arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    args: IndexMap<String, (CliOption, CliValue)>,
}

impl CliArgs {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument.
    pub fn arg(mut self, name: impl Into<String>, option: CliOption, value: impl Into<CliValue>) -> Self {
        self.args.insert(name.into(), (option, value.into()));
        self
    }

    /// Adds a [`CliOption::Value`] argument.
    pub fn value(self, name: impl Into<String>, value: impl Into<CliValue>) -> Self {
        self.arg(name, CliOption::Value, value)
    }

    /// Adds a [`CliOption::Plain`] argument.
    pub fn plain(self, name: impl Into<String>, value: impl Into<CliValue>) -> Self {
        self.arg(name, CliOption::Plain, value)
    }

    /// Adds a [`CliOption::Switch`] argument.
    pub fn switch(self, name: impl Into<String>, value: impl Into<CliValue>) -> Self {
        self.arg(name, CliOption::Switch, value)
    }

    /// Adds a [`CliOption::Positional`] argument.
    pub fn positional(self, name: impl Into<String>, value: impl Into<CliValue>) -> Self {
        self.arg(name, CliOption::Positional, value)
    }

    /// Number of arguments, including unset ones.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// True if there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Builds command lines for one shell.
#[derive(Debug, Clone, Copy)]
pub struct CliBuilder {
    shell: Shell,
}

impl CliBuilder {
    /// Creates a builder for `shell`.
    pub fn new(shell: Shell) -> Self {
        Self { shell }
    }

    /// Target shell.
    pub fn shell(&self) -> Shell {
        self.shell
    }

    /// Full command line as a string, for `Connection::run`.
    pub fn command(&self, command: &str, args: &CliArgs) -> String {
        self.build(Some(command), args, true).join(" ")
    }

    /// Full argument vector, for `Connection::exec`.
    pub fn argv(&self, command: &str, args: &CliArgs) -> Vec<String> {
        self.build(Some(command), args, false)
    }

    /// Arguments without the command.
    pub fn args(&self, args: &CliArgs, quote_value: bool) -> Vec<String> {
        self.build(None, args, quote_value)
    }

    fn prefix(&self) -> &'static str {
        match self.shell {
            Shell::Bash => "--",
            Shell::Powershell => "-",
        }
    }

    fn build(&self, command: Option<&str>, args: &CliArgs, quote_value: bool) -> Vec<String> {
        let quote = |value: &str| {
            if quote_value {
                self.shell.quote(value)
            } else {
                value.to_string()
            }
        };

        let mut argv: Vec<String> = command.map(|c| vec![c.to_string()]).unwrap_or_default();
        for (name, (option, value)) in &args.args {
            if *value == CliValue::Unset {
                continue;
            }

            let option_name = format!("{}{name}", self.prefix());
            match option {
                CliOption::Positional => argv.extend(value.values().iter().map(|v| quote(v))),
                CliOption::Switch => {
                    let enabled = match value {
                        CliValue::Bool(b) => *b,
                        _ => true,
                    };
                    match self.shell {
                        Shell::Powershell => {
                            let flag = if enabled { "$True" } else { "$False" };
                            argv.push(format!("{option_name}:{flag}"));
                        }
                        Shell::Bash if enabled => argv.push(option_name),
                        Shell::Bash => {}
                    }
                }
                CliOption::Value => {
                    for v in value.values() {
                        argv.push(option_name.clone());
                        argv.push(quote(&v));
                    }
                }
                CliOption::Plain => {
                    for v in value.values() {
                        argv.push(option_name.clone());
                        argv.push(v);
                    }
                }
            }
        }

        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user_args() -> CliArgs {
        CliArgs::new()
            .value("password", None::<String>)
            .value("home", "/home/jdoe")
            .switch("enabled", true)
            .switch("locked", false)
            .positional("login", "jdoe")
    }

    #[test]
    fn test_bash_command() {
        let cli = CliBuilder::new(Shell::Bash);
        assert_eq!(
            cli.command("add-user", &user_args()),
            "add-user --home '/home/jdoe' --enabled 'jdoe'"
        );
        assert_eq!(
            cli.argv("add-user", &user_args()),
            vec!["add-user", "--home", "/home/jdoe", "--enabled", "jdoe"]
        );
        assert_eq!(
            cli.args(&user_args(), false),
            vec!["--home", "/home/jdoe", "--enabled", "jdoe"]
        );
    }

    #[test]
    fn test_powershell_command() {
        let cli = CliBuilder::new(Shell::Powershell);
        assert_eq!(
            cli.command("New-User", &user_args()),
            "New-User -home '/home/jdoe' -enabled:$True -locked:$False 'jdoe'"
        );
    }

    #[test]
    fn test_list_and_plain_values() {
        let cli = CliBuilder::new(Shell::Bash);
        let args = CliArgs::new()
            .value("group", vec!["wheel", "users"])
            .plain("uid", 1000_i64)
            .positional("names", vec!["a", "b"]);
        assert_eq!(
            cli.command("cmd", &args),
            "cmd --group 'wheel' --group 'users' --uid 1000 'a' 'b'"
        );
        assert_eq!(args.len(), 3);
    }
}
