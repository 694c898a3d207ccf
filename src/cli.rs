use clap::Parser;
use std::path::PathBuf;

const HELP_EPILOG: &str = r#"Options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml; missing file falls back to defaults)
  DB_PATH     (default: data/machinelog.db)
  PORT        (default: 5190 or config.listen_port)
"#;

#[derive(Debug, Parser)]
#[command(
    name = "machinelog",
    version,
    about = "Machine inspection log server",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}
