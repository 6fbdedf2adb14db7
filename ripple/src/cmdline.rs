use clap::Command;

pub(super) fn root_cli() -> Command {
    Command::new("ripple")
        .author("Ripple Authors")
        .about("Ripple processes Kafka topics for a consumer group")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_consume_subcommand())
        .subcommand(add_version_subcommand())
}

fn add_consume_subcommand() -> Command {
    Command::new("consume")
        .about("Joins the consumer group configured through RIPPLE_CONSUMER_OBJECT")
}

fn add_version_subcommand() -> Command {
    Command::new("version").about("Prints the build information")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        root_cli().debug_assert();
    }

    #[test]
    fn test_subcommands() {
        let matches = root_cli().try_get_matches_from(["ripple", "consume"]).unwrap();
        assert_eq!(matches.subcommand_name(), Some("consume"));
        assert!(root_cli().try_get_matches_from(["ripple"]).is_err());
    }
}
