use clap::Parser;

/// Generic function to get an environment variable, parsing it to the desired type.
///
/// Unset variables and values that fail to parse both yield `None`.
pub fn get_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Like [`get_env`], falling back to `default` when the variable is unset or unparsable.
pub fn get_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    get_env(key).unwrap_or(default)
}

/// Parses the process command line arguments.
pub fn parse_args<T: Parser>() -> Result<T, clap::Error> {
    T::try_parse()
}

/// Parses an explicit argument list; the first item is the binary name.
pub fn parse_args_from<T, I, S>(args: I) -> Result<T, clap::Error>
where
    T: Parser,
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString> + Clone,
{
    T::try_parse_from(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser, Debug)]
    struct TestArgs {
        #[clap(long, default_value = "5")]
        interval_ms: u64,
    }

    #[test]
    fn test_get_env_missing_and_unparsable() {
        assert_eq!(get_env::<u64>("NODE_ENTRYPOINTS_TEST_SURELY_UNSET"), None);
        assert_eq!(get_env_or("NODE_ENTRYPOINTS_TEST_SURELY_UNSET", 7u64), 7);
    }

    #[test]
    fn test_parse_args_from() {
        let args: TestArgs = parse_args_from(["node", "--interval-ms", "250"]).unwrap();
        assert_eq!(args.interval_ms, 250);

        let defaults: TestArgs = parse_args_from(["node"]).unwrap();
        assert_eq!(defaults.interval_ms, 5);

        assert!(parse_args_from::<TestArgs, _, _>(["node", "--interval-ms", "soon"]).is_err());
    }
}
