use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for the stage2 workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the CLI
    Run {
        /// Arguments passed to the CLI
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Run the workspace tests
    Test,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            let status = Command::new("cargo").arg("build").status()?;
            if !status.success() {
                anyhow::bail!("Build failed");
            }
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let status = Command::new("cargo")
                .arg("run")
                .arg("-p")
                .arg("stage2-cli")
                .arg("--")
                .args(args)
                .status()?;
            if !status.success() {
                anyhow::bail!("Run failed");
            }
        }
        Commands::Test => {
            println!("Testing workspace...");
            let status = Command::new("cargo")
                .arg("test")
                .arg("--workspace")
                .status()?;
            if !status.success() {
                anyhow::bail!("Tests failed");
            }
        }
    }

    Ok(())
}
