//! Reads requests from stdin and performs them via a courier worker.
//!
//! Each line is one of:
//! * `GET https://example.com/fish` (or any other method, optionally followed by a JSON body)
//! * `INVALIDATE https://example.com/fish [METHOD]`
//! * `CLEAR`
//!
//! Lines are processed concurrently, so that entering the same GET twice in a row shows the
//! deduplication in action.
use std::str::FromStr;
use std::sync::Arc;

use courier::builder::Builder;
use courier::protocol::interface::Interface;
use courier::request::{Method, RequestOptions};
use tokio::io::AsyncBufReadExt;

use crate::transport::HyperTransport;

mod transport;

#[derive(Debug, PartialEq)]
enum Command {
    Request(String, RequestOptions),
    Invalidate(String, Option<Method>),
    Clear,
}

fn parse_command(line: &str) -> anyhow::Result<Command> {
    let mut parts = line.trim().splitn(3, char::is_whitespace);
    let verb = parts.next().unwrap_or("");
    let url = parts.next().map(str::trim).filter(|url| !url.is_empty());
    let rest = parts.next().map(str::trim).filter(|rest| !rest.is_empty());

    match (verb.to_uppercase().as_str(), url) {
        ("CLEAR", None) => Ok(Command::Clear),
        ("INVALIDATE", Some(url)) => {
            let method = rest.map(Method::from_str).transpose()?;
            Ok(Command::Invalidate(url.to_owned(), method))
        }
        (_, Some(url)) => {
            let mut options = RequestOptions::with_method(Method::from_str(verb)?);
            if let Some(body) = rest {
                options = options.body(serde_json::from_str(body)?);
            }
            Ok(Command::Request(url.to_owned(), options))
        }
        _ => Err(anyhow::anyhow!(
            "Usage: <METHOD> <URL> [JSON body] | INVALIDATE <URL> [METHOD] | CLEAR"
        )),
    }
}

async fn execute(interface: Interface, command: Command) {
    match command {
        Command::Request(url, options) => {
            let label = format!("{} {}", options.method(), url);
            match interface.add_request(url, Some(options)).response().await {
                Ok(Some(value)) => println!("{} -> {}", label, value),
                Ok(None) => println!("{} -> (no response)", label),
                Err(error) => println!("{} -> ERROR: {}", label, error),
            }
        }
        Command::Invalidate(url, method) => match interface.invalidate(url.as_str(), method).await {
            Ok(_) => println!("INVALIDATE {} -> OK", url),
            Err(error) => println!("INVALIDATE {} -> ERROR: {}", url, error),
        },
        Command::Clear => match interface.clear().await {
            Ok(_) => println!("CLEAR -> OK"),
            Err(error) => println!("CLEAR -> ERROR: {}", error),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let worker = Builder::new()
        .enable_logging()
        .config_file("config/settings.yml")
        .spawn(Arc::new(HyperTransport::new()))
        .await?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received CTRL-C. Shutting down...");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_command(&line) {
                    Ok(command) => courier::spawn!(execute(worker.interface().clone(), command)),
                    Err(error) => println!("{}", error),
                },
                None => break,
            }
        }
    }

    worker.join().await
}
