use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use zbus::proxy;

#[proxy(
    interface = "io.rollcall.Rollcall1",
    default_service = "io.rollcall.Rollcall1",
    default_path = "/io/rollcall/Rollcall1"
)]
trait Rollcall {
    fn recognize(&self, frame: &[u8]) -> zbus::Result<String>;
    fn mark_attendance(&self, frame: &[u8]) -> zbus::Result<String>;
    fn mark_identity(&self, kind: &str, id: &str) -> zbus::Result<String>;
    fn list_attendance(&self, query_json: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify every face in an image file
    Recognize {
        /// Encoded image (JPEG/PNG) to send to the daemon
        image: PathBuf,
    },
    /// Mark attendance for the first face in an image file
    Mark {
        image: PathBuf,
    },
    /// Mark attendance for a known identity without a frame
    MarkIdentity {
        /// "registered" or "visitor"
        #[arg(short, long)]
        kind: String,
        /// Registered id or visitor UUID
        #[arg(short, long)]
        id: String,
    },
    /// List attendance records
    List(ListArgs),
    /// Show daemon status
    Status,
}

#[derive(Args, Serialize, Debug, Default)]
struct ListArgs {
    /// Only "registered" or "visitor" records
    #[arg(long, value_parser = ["registered", "visitor"])]
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    /// Local date, YYYY-MM-DD
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    /// Local time of day, HH:MM (whole minute)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[arg(long, value_parser = ["last_7_days", "last_month"])]
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    #[arg(long, value_parser = ["asc", "desc", "recent"])]
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<String>,
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    let conn = conn.context("cannot connect to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match cli.command {
        Commands::Recognize { image } => proxy.recognize(&read_frame(&image)?).await?,
        Commands::Mark { image } => proxy.mark_attendance(&read_frame(&image)?).await?,
        Commands::MarkIdentity { kind, id } => proxy.mark_identity(&kind, &id).await?,
        Commands::List(args) => {
            let query = serde_json::to_string(&args)?;
            tracing::debug!(%query, "listing attendance");
            proxy.list_attendance(&query).await?
        }
        Commands::Status => proxy.status().await?,
    };

    println!("{}", pretty(&reply));
    Ok(())
}

fn read_frame(path: &Path) -> Result<Vec<u8>> {
    let frame = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    anyhow::ensure!(!frame.is_empty(), "{} is empty", path.display());
    Ok(frame)
}

/// Pretty-print a JSON reply, or return it unchanged if it is not JSON.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_args_to_query_json() {
        let cli = Cli::try_parse_from([
            "rollcall", "list", "--kind", "visitor", "--range", "last_7_days", "--limit", "10",
        ])
        .unwrap();
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        let json: serde_json::Value = serde_json::to_value(&args).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "visitor", "range": "last_7_days", "limit": 10})
        );
        assert_eq!(serde_json::to_string(&ListArgs::default()).unwrap(), "{}");
    }

    #[test]
    fn test_rejects_unknown_range() {
        assert!(Cli::try_parse_from(["rollcall", "list", "--range", "yesterday"]).is_err());
    }

    #[test]
    fn test_mark_identity_args() {
        let cli = Cli::try_parse_from([
            "rollcall", "--session", "mark-identity", "--kind", "registered", "--id", "12",
        ])
        .unwrap();
        assert!(cli.session);
        assert!(matches!(
            cli.command,
            Commands::MarkIdentity { ref kind, ref id } if kind == "registered" && id == "12"
        ));
    }

    #[test]
    fn test_pretty_passthrough() {
        assert_eq!(pretty("not json"), "not json");
        assert!(pretty(r#"{"status":"duplicate"}"#).contains("\"status\": \"duplicate\""));
    }
}
