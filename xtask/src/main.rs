//! Build automation tasks for the whdb workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Crates whose tests `cargo xtask test` runs by default.
const TEST_CRATES: &[&str] = &["whdb-client", "whdb-pool", "whdb-testing"];

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for the whdb driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, test, doc)
    Ci,
    /// Run cargo fmt --check
    Fmt,
    /// Run clippy on every target
    Clippy,
    /// Run tests, optionally for a single crate
    Test {
        /// Crate to test (defaults to all driver crates)
        #[arg(short, long)]
        package: Option<String>,
        /// Show tracing output from the tests
        #[arg(long)]
        nocapture: bool,
    },
    /// Build documentation, failing on broken intra-doc links
    Doc,
    /// Clean build artifacts
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            test(&sh, None, false)?;
            doc(&sh)?;
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test { package, nocapture } => test(&sh, package.as_deref(), nocapture)?,
        Command::Doc => doc(&sh)?,
        Command::Clean => clean(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let path = String::from_utf8(output.stdout)
        .context("invalid UTF-8 in cargo output")?
        .trim()
        .to_string();

    Ok(PathBuf::from(path)
        .parent()
        .context("failed to get workspace root")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    println!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    println!("Formatting check passed.");
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    println!("Clippy check passed.");
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>, nocapture: bool) -> Result<()> {
    let packages: Vec<&str> = match package {
        Some(package) => {
            if !TEST_CRATES.contains(&package) {
                anyhow::bail!(
                    "unknown crate `{package}`; expected one of: {}",
                    TEST_CRATES.join(", ")
                );
            }
            vec![package]
        }
        None => TEST_CRATES.to_vec(),
    };

    let mut args = Vec::new();
    for package in &packages {
        args.push("-p");
        args.push(package);
    }
    let extra: &[&str] = if nocapture { &["--", "--nocapture"] } else { &[] };

    println!("Running tests for {}...", packages.join(", "));
    cmd!(sh, "cargo test {args...} {extra...}").run()?;
    println!("All tests passed.");
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    println!("Generating documentation...");
    cmd!(sh, "cargo doc --workspace --no-deps")
        .env("RUSTDOCFLAGS", "-D rustdoc::broken_intra_doc_links")
        .run()?;
    println!("Documentation generated.");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("Cleaning build artifacts...");
    cmd!(sh, "cargo clean").run()?;
    println!("Clean complete.");
    Ok(())
}
