use anyhow::{Result, bail};
use chirp_conduit::Payload;
use std::path::Path;

use crate::HistoryArgs;
use crate::db::{Database, StoredMessage};

/// Print the stored message history.
pub async fn history_command(db_path: Option<&Path>, args: HistoryArgs) -> Result<()> {
    let Some(path) = db_path else {
        bail!("The message store is disabled ([feed] enabled = false)");
    };
    if !path.exists() {
        println!("No messages stored yet.");
        return Ok(());
    }

    let db = Database::open(path).await?;
    let messages = match args.limit {
        Some(n) => db.recent_messages(n).await?,
        None => db.all_messages().await?,
    };

    if args.json {
        let rows: Vec<serde_json::Value> = messages.iter().map(message_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for message in &messages {
            println!("{}", format_line(message));
        }
    }
    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn format_line(message: &StoredMessage) -> String {
    let body = match &message.payload {
        Payload::Text(text) => text.clone(),
        Payload::Binary(bytes) => format!("<{} bytes binary>", bytes.len()),
    };
    format!(
        "{:>6}  {}  {}",
        message.id,
        format_timestamp(message.created_at),
        body
    )
}

fn message_json(message: &StoredMessage) -> serde_json::Value {
    let (kind, body) = match &message.payload {
        Payload::Text(text) => ("text", serde_json::Value::String(text.clone())),
        Payload::Binary(bytes) => ("binary", serde_json::json!(bytes)),
    };
    serde_json::json!({
        "id": message.id,
        "kind": kind,
        "body": body,
        "created_at": message.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: i64, payload: Payload) -> StoredMessage {
        StoredMessage {
            id,
            payload,
            created_at: 0,
        }
    }

    #[test]
    fn test_format_line_text() {
        let line = format_line(&stored(7, Payload::from("hi there")));
        assert!(line.contains("     7"));
        assert!(line.contains("1970-01-01 00:00:00"));
        assert!(line.ends_with("hi there"));
    }

    #[test]
    fn test_format_line_binary() {
        let line = format_line(&stored(1, Payload::Binary(vec![0; 12])));
        assert!(line.ends_with("<12 bytes binary>"));
    }

    #[test]
    fn test_message_json() {
        let value = message_json(&stored(3, Payload::Binary(vec![1, 2])));
        assert_eq!(value["id"], 3);
        assert_eq!(value["kind"], "binary");
        assert_eq!(value["body"], serde_json::json!([1, 2]));

        let value = message_json(&stored(4, Payload::from("x")));
        assert_eq!(value["kind"], "text");
        assert_eq!(value["body"], "x");
    }
}
