//! Configuration loading for `capctl`.
//!
//! Leading configuration flags are split from the rest of the command line
//! and handed to `ortho_config`, which layers them over the file and the
//! `CAPCHILD_*` environment. The remaining tokens go to the clap parser.

use std::ffi::{OsStr, OsString};

use capchild_config::Config;
use ortho_config::OrthoConfig;

use crate::errors::AppError;

/// Flags owned by the configuration loader.
///
/// They must precede the subcommand. Keep in step with the fields of
/// [`Config`].
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--worker-path",
    "--poll-interval-ms",
    "--line-limit",
    "--stop-grace-ms",
    "--stop-method",
    "--log-filter",
    "--log-format",
];

pub(crate) trait ConfigLoader {
    /// Loads and validates configuration from the split-out flags.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        let config = Config::load_from_iter(args.iter().cloned()).map_err(AppError::Config)?;
        config.validate()?;
        Ok(config)
    }
}

/// Loader returning a fixed configuration.
#[cfg(test)]
pub(crate) struct FixedConfigLoader(pub(crate) Config);

#[cfg(test)]
impl ConfigLoader for FixedConfigLoader {
    fn load(&self, _args: &[OsString]) -> Result<Config, AppError> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Stop,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Stop;
    }
    let mut parts = text.splitn(2, '=');
    let flag = parts.next().unwrap_or_default();
    let inline_value = parts.next().is_some();
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !inline_value,
        }
    } else {
        FlagAction::Stop
    }
}

/// The command line divided between the configuration loader and clap.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ArgumentSplit {
    pub(crate) config: Vec<OsString>,
    pub(crate) command: Vec<OsString>,
}

/// Moves leading configuration flags, with their values, into
/// [`ArgumentSplit::config`]. Both halves keep the program name.
pub(crate) fn split_arguments(args: &[OsString]) -> ArgumentSplit {
    let mut tokens = args.iter();
    let Some(program) = tokens.next() else {
        return ArgumentSplit::default();
    };
    let mut config = vec![program.clone()];
    let mut command = vec![program.clone()];
    let mut pending_value = false;

    for argument in tokens.by_ref() {
        if pending_value {
            config.push(argument.clone());
            pending_value = false;
            continue;
        }
        match classify(argument) {
            FlagAction::Include { needs_value } => {
                config.push(argument.clone());
                pending_value = needs_value;
            }
            FlagAction::Stop => {
                command.push(argument.clone());
                break;
            }
        }
    }
    command.extend(tokens.cloned());
    ArgumentSplit { config, command }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[rstest]
    #[case("--log-filter=debug", FlagAction::Include { needs_value: false })]
    #[case("--log-filter", FlagAction::Include { needs_value: true })]
    #[case("interfaces", FlagAction::Stop)]
    #[case("--output", FlagAction::Stop)]
    fn flags_are_classified(#[case] argument: &str, #[case] expected: FlagAction) {
        assert_eq!(classify(OsStr::new(argument)), expected);
    }

    #[rstest]
    fn leading_config_flags_are_split_off() {
        let split = split_arguments(&os(&[
            "capctl",
            "--config-path",
            "/etc/capchild.toml",
            "--stop-method=terminate",
            "capture",
            "--log-filter",
            "x",
        ]));

        assert_eq!(
            split.config,
            os(&["capctl", "--config-path", "/etc/capchild.toml", "--stop-method=terminate"])
        );
        assert_eq!(split.command, os(&["capctl", "capture", "--log-filter", "x"]));
    }

    #[rstest]
    fn empty_arguments_split_into_nothing() {
        assert_eq!(split_arguments(&[]), ArgumentSplit::default());
    }
}
