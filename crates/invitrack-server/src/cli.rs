use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "invitrack", about = "Invite cache and join attribution service")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/invitrack.toml")]
    pub config: String,

    /// Emit JSON logs regardless of the configured format
    #[arg(long)]
    pub json_logs: bool,
}
