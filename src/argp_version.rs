//! `--version`/`-V` support for `argp`, which exits before the command line
//! proper is validated.
use std::ffi::OsStr;

use argp::{parser::ParseGlobalOptions, EarlyExit, FromArgs, TopLevelCommand};

/// Version string printed by `-V`, e.g. `ftk 0.3.1 1a2b3c4`.
fn version_line(command_name: &str) -> String {
    format!("{} {} {}", command_name, env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT_SHA"))
}

struct WithVersion<T>(T)
where T: FromArgs;

impl<T> TopLevelCommand for WithVersion<T> where T: FromArgs {}

impl<T> FromArgs for WithVersion<T>
where T: FromArgs
{
    fn _from_args(
        command_name: &[&str],
        args: &[&OsStr],
        parent: Option<&mut dyn ParseGlobalOptions>,
    ) -> Result<Self, EarlyExit> {
        /// Catches `--version`-only invocations.
        #[derive(FromArgs)]
        struct VersionOnly {
            /// Print version information and exit.
            #[argp(switch, short = 'V')]
            pub version: bool,
        }

        match VersionOnly::from_args(command_name, args) {
            Ok(VersionOnly { version: true }) => {
                println!("{}", version_line(command_name.first().copied().unwrap_or("ftk")));
                std::process::exit(0);
            }
            // The version switch is also declared on `T`, so its help covers it.
            Err(EarlyExit::Help(_)) => T::from_args(command_name, &["--help"]).map(Self),
            Ok(_) | Err(EarlyExit::Err(_)) => T::_from_args(command_name, args, parent).map(Self),
        }
    }
}

/// Parses `T` from the process arguments, handling `-V` first. Exits on
/// parse errors and `--help`.
pub fn from_env<T>() -> T
where T: TopLevelCommand {
    argp::parse_args_or_exit::<WithVersion<T>>(argp::DEFAULT).0
}
