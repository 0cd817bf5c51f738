use super::Parser;

#[derive(Parser, Debug)]
pub struct Cli {
    /// Settings file, defaults to `settings/dev.toml` in debug builds.
    #[arg(long)]
    pub settings: Option<String>,

    /// Users signed in by the walkthrough; the first two chat with each other.
    #[arg(long, value_delimiter = ',', default_values_t = [String::from("alice"), String::from("bob"), String::from("carol")])]
    pub users: Vec<String>,
}
