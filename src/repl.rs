//! Interactive SQL shell.

use crate::commands::{format_result, json_lines, parse_time};
use chrono::Utc;
use colored::Colorize;
use openplant_client::{ArchiveMode, Client};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Anything not starting with '.' is sent to the server as SQL.

Shell commands:
  .help                             Show this help
  .ping                             Check the connection
  .read <id,...>                    Read realtime values
  .archive <id,...> <begin> <end> [mode] [interval]
                                    Read archived values
  .stat <id,...> <begin> <end> [interval]
                                    Read interval statistics
  .reconnect                        Re-dial the server
  .quit, .exit                      Exit the shell

Times are 'now', offsets like -5m or -2h, or RFC 3339.
"#;

pub async fn run(client: Client, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "OpenPlant SQL shell".bold().cyan());
    println!("{} {}", "Connected to".green(), addr);

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".openplant_history"))
        .unwrap_or_else(|_| ".openplant_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type '.help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "openplant>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_line(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

fn parse_ids(arg: &str) -> Result<Vec<i32>, std::num::ParseIntError> {
    arg.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse())
        .collect()
}

fn or_no_rows(output: String) -> String {
    if output.is_empty() {
        "(0 rows)".dimmed().to_string()
    } else {
        output
    }
}

async fn execute_line(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let Some(meta) = line.strip_prefix('.') else {
        let sql = line.trim_end_matches(';');
        let rs = client.exec_sql(sql).await?;
        return Ok(Some(format_result(&rs)?));
    };

    let parts: Vec<&str> = meta.split_whitespace().collect();
    let Some(cmd) = parts.first() else {
        return Ok(Some(String::new()));
    };
    let args = &parts[1..];

    match cmd.to_lowercase().as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => {
            client.alive().await?;
            Ok(Some("PONG".green().to_string()))
        }

        "reconnect" => {
            client.reconnect().await?;
            tracing::info!("reconnected from shell");
            Ok(Some("Reconnected".green().to_string()))
        }

        "read" | "r" => {
            let Some(ids) = args.first() else {
                return Ok(Some("Usage: .read <id,...>".to_string()));
            };
            let values = client.read_realtime(&parse_ids(ids)?).await?;
            Ok(Some(or_no_rows(json_lines(&values)?)))
        }

        "archive" | "a" => {
            if args.len() < 3 {
                return Ok(Some(
                    "Usage: .archive <id,...> <begin> <end> [mode] [interval]".to_string(),
                ));
            }
            let now = Utc::now();
            let mode: ArchiveMode = args.get(3).map_or(Ok(ArchiveMode::Raw), |m| m.parse())?;
            let interval = args.get(4).map_or(Ok(0), |i| i.parse())?;
            let values = client
                .read_archive(
                    &parse_ids(args[0])?,
                    parse_time(args[1], now)?,
                    parse_time(args[2], now)?,
                    mode,
                    interval,
                )
                .await?;
            Ok(Some(or_no_rows(json_lines(&values)?)))
        }

        "stat" | "s" => {
            if args.len() < 3 {
                return Ok(Some(
                    "Usage: .stat <id,...> <begin> <end> [interval]".to_string(),
                ));
            }
            let now = Utc::now();
            let interval = args.get(3).map_or(Ok(60), |i| i.parse())?;
            let stats = client
                .read_stat(
                    &parse_ids(args[0])?,
                    parse_time(args[1], now)?,
                    parse_time(args[2], now)?,
                    interval,
                )
                .await?;
            Ok(Some(or_no_rows(json_lines(&stats)?)))
        }

        other => Ok(Some(format!(
            "Unknown command: .{}. Type '.help' for help.",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_ids("1024,1025,").unwrap(), vec![1024, 1025]);
        assert!(parse_ids("10x").is_err());
    }

    #[test]
    fn test_empty_result_message() {
        let none: Vec<i32> = Vec::new();
        assert!(or_no_rows(json_lines(&none).unwrap()).contains("(0 rows)"));
        assert_eq!(or_no_rows(json_lines(&[1, 2]).unwrap()), "1\n2");
    }
}
