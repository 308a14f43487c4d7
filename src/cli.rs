/// `main [config path] [--test <username>]`
#[derive(Debug, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<String>,
    pub test_user: Option<String>,
}

impl CliArgs {
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut parsed = CliArgs::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--test" => {
                    let username = args
                        .next()
                        .ok_or_else(|| "--test needs a username".to_string())?;
                    parsed.test_user = Some(username);
                }
                flag if flag.starts_with("--") => return Err(format!("unknown option {flag}")),
                _ if parsed.config.is_none() => parsed.config = Some(arg),
                _ => return Err(format!("unexpected argument {arg}")),
            }
        }
        Ok(parsed)
    }
}
