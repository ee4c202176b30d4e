use clap::Parser;
use std::path::PathBuf;

use crate::model::Platform;

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture live-stream danmaku into a JSON file", long_about = None)]
pub struct CliArgs {
    /// Live-stream platform
    #[arg(short, long, value_enum)]
    pub platform: Platform,

    /// Room identifier on the platform
    #[arg(short, long)]
    pub room_id: String,

    /// Output file (defaults to {platform}_{room_id}_{timestamp}.json)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run the browser without a window
    #[arg(long)]
    pub headless: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,
}
