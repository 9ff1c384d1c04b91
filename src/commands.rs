//! Command execution.

use crate::Commands;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use colored::Colorize;
use openplant_client::{
    ArchiveMode, Client, ClientConfig, RealValue, ResultSet, SubscriptionEvent,
};
use serde::Serialize;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    tracing::debug!(command = cmd.name(), "executing");
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Ping => {
            client.alive().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Sql { query } => {
            let rs = client.exec_sql(&query).await?;
            Ok(format_result(&rs)?)
        }

        Commands::Read { ids } => {
            let values = client.read_realtime(&ids).await?;
            Ok(json_lines(&values)?)
        }

        Commands::Write {
            id,
            value,
            status,
            time,
        } => {
            let time = match time {
                Some(t) => parse_time(&t, Utc::now())?,
                None => Utc::now(),
            };
            client
                .write_realtime(&[RealValue::new(id, time, value).with_status(status)])
                .await?;
            Ok(format!("{} point {}", "Wrote".green(), id.to_string().cyan()))
        }

        Commands::Archive {
            ids,
            begin,
            end,
            mode,
            interval,
        } => {
            let now = Utc::now();
            let mode: ArchiveMode = mode.parse()?;
            let values = client
                .read_archive(&ids, parse_time(&begin, now)?, parse_time(&end, now)?, mode, interval)
                .await?;
            Ok(json_lines(&values)?)
        }

        Commands::Stat {
            ids,
            begin,
            end,
            interval,
        } => {
            let now = Utc::now();
            let stats = client
                .read_stat(&ids, parse_time(&begin, now)?, parse_time(&end, now)?, interval)
                .await?;
            Ok(json_lines(&stats)?)
        }

        // Subscribe streams events and is handled in main.rs
        Commands::Subscribe { .. } => unreachable!(),
    }
}

/// Prints subscription events as JSON lines until Ctrl+C.
pub async fn stream_subscription(
    client: &Client,
    config: &ClientConfig,
    ids: &[i32],
    snapshot: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = config.subscribe_options().with_snapshot(snapshot);
    let mut sub = client
        .subscribe_with("Realtime", "ID", ids.to_vec(), options)
        .await?;
    eprintln!(
        "{} {} point(s)",
        "Subscribed to".green(),
        ids.len().to_string().cyan()
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            event = sub.next_event() => {
                match event {
                    Some(SubscriptionEvent::Data { rows, snapshot }) => {
                        tracing::debug!(rows = rows.len(), snapshot, "subscription data");
                        for row in &rows {
                            println!("{}", serde_json::to_string(row)?);
                        }
                    }
                    Some(SubscriptionEvent::Error { kind, message }) => {
                        tracing::warn!(?kind, %message, "subscription error");
                        eprintln!("{} ({:?}): {}", "Warning".yellow(), kind, message);
                    }
                    Some(SubscriptionEvent::Recovered) => {
                        eprintln!("{}", "Subscription recovered".green());
                    }
                    None => {
                        eprintln!("{}", "Subscription closed".red());
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping subscription...".dimmed());
                break;
            }
        }
    }

    sub.close().await?;
    Ok(())
}

/// Renders rows as JSON lines, or a summary for row-less results.
pub fn format_result(rs: &ResultSet) -> Result<String, serde_json::Error> {
    if rs.is_empty() {
        return Ok(if rs.columns.is_empty() {
            "OK".green().to_string()
        } else {
            "(0 rows)".dimmed().to_string()
        });
    }
    let lines = rs
        .rows
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

/// One JSON object per item; empty for no items.
pub fn json_lines<T: Serialize>(items: &[T]) -> Result<String, serde_json::Error> {
    let lines = items
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

/// Parses an absolute timestamp or an offset from `now`.
///
/// Accepts `now`, relative offsets such as `-90s`, `-5m`, `-2h`, `-1d`,
/// RFC 3339, and `YYYY-MM-DD HH:MM:SS[.fff]` taken as UTC.
pub fn parse_time(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Some(rest) = s.strip_prefix('-').or_else(|| s.strip_prefix('+')) {
        let sign = if s.starts_with('-') { -1 } else { 1 };
        if let Some(offset) = parse_offset(rest) {
            return Ok(now + offset * sign);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("invalid time: {s}"))
}

fn parse_offset(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (n, unit) = s.split_at(split);
    let n: i64 = n.parse().ok()?;
    match unit {
        "s" => Some(Duration::seconds(n)),
        "m" => Some(Duration::minutes(n)),
        "h" => Some(Duration::hours(n)),
        "d" => Some(Duration::days(n)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use openplant_protocol::{Table, Value, VarType};
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_relative() {
        assert_eq!(parse_time("now", now()).unwrap(), now());
        assert_eq!(parse_time("-5m", now()).unwrap(), now() - Duration::minutes(5));
        assert_eq!(parse_time("+1d", now()).unwrap(), now() + Duration::days(1));
        assert!(parse_time("-5w", now()).is_err());
    }

    #[test]
    fn test_parse_absolute() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_time("2026-01-02 03:04:05", now()).unwrap(), expected);
        assert_eq!(parse_time("2026-01-02T03:04:05Z", now()).unwrap(), expected);
        assert_eq!(
            parse_time("2026-01-02 03:04:05.250", now()).unwrap(),
            expected + Duration::milliseconds(250)
        );
        assert!(parse_time("yesterday", now()).is_err());
    }

    #[test]
    fn test_json_lines() {
        let none: Vec<i32> = Vec::new();
        assert_eq!(json_lines(&none).unwrap(), "");
        let mut row = BTreeMap::new();
        row.insert("ID".to_string(), Value::Int32(7));
        assert_eq!(json_lines(&[row.clone(), row]).unwrap(), "{\"ID\":7}\n{\"ID\":7}");
    }

    #[test]
    fn test_command_names() {
        assert_eq!(Commands::Ping.name(), "ping");
        let cmd = Commands::Subscribe {
            ids: vec![1024],
            no_snapshot: false,
        };
        assert_eq!(cmd.name(), "subscribe");
    }

    #[test]
    fn test_format_result() {
        let mut row = BTreeMap::new();
        row.insert("ID".to_string(), Value::Int32(1024));
        row.insert("AV".to_string(), Value::Double(1.5));
        let mut table = Table::new("Realtime");
        table.add_column("ID", VarType::Int32, 0).unwrap();
        let rs = ResultSet {
            columns: table.columns().to_vec(),
            rows: vec![row],
        };
        assert_eq!(format_result(&rs).unwrap(), r#"{"AV":1.5,"ID":1024}"#);
    }
}
