//! ferry - interactive client for a ferryd share
//!
//! Reads `LIST | DOWNLOAD <file> | UPLOAD <file> | EXIT` from stdin and
//! runs each against the server, one at a time.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write as _;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

use ferry::cli::ClientOpts;
use ferry::client::{Client, ClientError};
use ferry::logging::init_tracing;
use ferry::protocol::verb;

const PROMPT: &str = "\nEnter command (LIST | DOWNLOAD <filename> | UPLOAD <filename> | EXIT): ";

fn prompt() {
    print!("{PROMPT}");
    let _ = std::io::stdout().flush();
}

/// Outcome of one typed line.
enum Step {
    Continue,
    Quit,
}

async fn run_line(client: &mut Client, line: &str, dir: &Path) -> Result<Step, ClientError> {
    if line == verb::LIST {
        let names = client.list().await?;
        println!("\nFiles on server:");
        if names.is_empty() {
            println!("(no files)");
        }
        for n in names {
            println!("{n}");
        }
    } else if let Some(name) = line.strip_prefix("DOWNLOAD ") {
        println!("Downloading {name}");
        let bytes = client.download(name, dir).await?;
        println!("Download finished ({bytes} bytes)");
    } else if let Some(file) = line.strip_prefix("UPLOAD ") {
        let local = dir.join(file);
        let remote = Path::new(file)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = client.upload(&local, &remote).await?;
        println!("Server: OK Uploaded ({bytes} bytes)");
    } else if line == verb::EXIT {
        return Ok(Step::Quit);
    } else {
        let resp = client.raw(line).await?;
        println!("Server: {resp}");
    }
    Ok(Step::Continue)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(&opts.log_level);

    let mut client = Client::connect(&opts.server)
        .await
        .with_context(|| format!("connect to {}", opts.server))?
        .legacy_list(opts.legacy_list)
        .show_progress(!opts.quiet);
    println!("[*] Connected to {}", opts.server);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_line(&mut client, line, &opts.dir).await {
            Ok(Step::Continue) => {}
            Ok(Step::Quit) => break,
            Err(e) if e.is_fatal() => {
                eprintln!("Connection lost: {e}");
                return Err(e.into());
            }
            Err(e) => println!("{e}"),
        }
    }

    println!("Closing connection");
    client.exit().await?;
    Ok(())
}
