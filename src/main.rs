//! Server supervisor entry point.
//!
//! Argv shape, kept for host compatibility: an optional GDX extension
//! path followed by an optional options JSON object. When the first
//! positional argument is itself a JSON object, it is taken as the
//! options argument and the extension-path slot is considered absent.
//!
//! stdout carries exactly one readiness line; all logs go to stderr.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use gdxview::config::{init_tracing, ServerOptions};
use gdxview::server::Server;

#[derive(Parser)]
#[command(name = "gdxview")]
#[command(about = "Query server for interactive exploration of GDX files")]
#[command(version)]
struct Cli {
    /// Path to the GDX reader engine extension
    extension_path: Option<String>,

    /// Startup options as a JSON object
    options: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (extension_arg, options_arg) = match (cli.extension_path, cli.options) {
        (Some(first), None) if first.trim_start().starts_with('{') => (None, Some(first)),
        (extension, options) => (extension, options),
    };

    let mut options = match options_arg {
        Some(raw) => ServerOptions::from_json(&raw)?,
        None => ServerOptions::default(),
    };
    if options.gdx_extension_path.is_none() {
        options.gdx_extension_path = extension_arg.map(PathBuf::from);
    }

    init_tracing(&options.logging);

    let server = Server::start(options).await?;
    server.report_ready();
    server.run().await
}
