use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
}

impl From<ArgMatches> for CliArgs {
    fn from(matches: ArgMatches) -> Self {
        CliArgs {
            config: matches.get_one::<PathBuf>("config").cloned(),
            port: matches.get_one::<u16>("port").copied(),
        }
    }
}

fn command() -> Command {
    Command::new("shifter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("keep one replica active and rotate it across a container fleet")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("TOML config file; SHIFTER_* environment variables take precedence")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port of the control API (overrides listen_port)")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16)),
        )
}

pub(crate) fn configure_cli() -> CliArgs {
    command().get_matches().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_and_port() {
        let args: CliArgs = command()
            .try_get_matches_from(["shifter", "--config", "/etc/shifter.toml", "-p", "9000"])
            .unwrap()
            .into();
        assert_eq!(args.config, Some(PathBuf::from("/etc/shifter.toml")));
        assert_eq!(args.port, Some(9000));
    }

    #[test]
    fn everything_is_optional() {
        let args: CliArgs = command().try_get_matches_from(["shifter"]).unwrap().into();
        assert!(args.config.is_none());
        assert!(args.port.is_none());
    }
}
