use std::path::PathBuf;

use clap::Parser;

/// Transparent postgres proxy that keeps every test session's writes
/// inside a rollbackable outer transaction
#[derive(Debug, Parser)]
#[command(name = "pgrollback", version)]
pub struct Args {
    /// Path to the yaml configuration file. Settings can also be supplied
    /// through PGROLLBACK_* environment variables.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default() {
        let args = Args::try_parse_from(["pgrollback"]).unwrap();

        assert_eq!(args.config, None);
    }

    #[test]
    fn test_args_config_path() {
        let args =
            Args::try_parse_from(["pgrollback", "--config", "/etc/pgrollback.yml"]).unwrap();

        assert_eq!(args.config, Some(PathBuf::from("/etc/pgrollback.yml")));
    }
}
