use sluice_config::Mode;

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub mode: Option<Mode>,
}

enum ParseOutcome {
    Args(CliArgs),
    Help,
}

fn usage() {
    eprintln!(
        "usage:
  sluice-ingest [--mode ingest|explore]

configuration comes from the environment; see README.
"
    );
}

fn parse_args_impl(mut args: impl Iterator<Item = String>) -> Result<ParseOutcome, String> {
    let mut mode: Option<Mode> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires a value".to_string())?;
                mode = Some(Mode::parse(&value).map_err(|err| err.to_string())?);
            }
            "-h" | "--help" | "help" => {
                return Ok(ParseOutcome::Help);
            }
            _ => {}
        }
    }

    Ok(ParseOutcome::Args(CliArgs { mode }))
}

pub fn parse_args() -> CliArgs {
    match parse_args_impl(std::env::args().skip(1)) {
        Ok(ParseOutcome::Args(args)) => args,
        Ok(ParseOutcome::Help) => {
            usage();
            std::process::exit(0);
        }
        Err(error) => {
            eprintln!("error: {error}");
            usage();
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_args_impl, ParseOutcome};
    use sluice_config::Mode;

    #[test]
    fn parse_args_rejects_mode_without_value() {
        let result = parse_args_impl(vec!["--mode".to_string()].into_iter());
        assert!(matches!(
            result,
            Err(error) if error == "--mode requires a value"
        ));
    }

    #[test]
    fn parse_args_accepts_explore_mode() {
        let result =
            parse_args_impl(vec!["--mode".to_string(), "explore".to_string()].into_iter());

        let Ok(ParseOutcome::Args(args)) = result else {
            panic!("expected parsed args");
        };

        assert_eq!(args.mode, Some(Mode::Explore));
    }

    #[test]
    fn parse_args_rejects_unknown_mode() {
        let result = parse_args_impl(vec!["--mode".to_string(), "turbo".to_string()].into_iter());
        assert!(result.is_err());
    }
}
