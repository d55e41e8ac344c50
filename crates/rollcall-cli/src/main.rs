use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{EncodingStore, Identity, Ledger};
use std::path::PathBuf;

const BUS_NAME: &str = "org.rollcall.Attendance1";

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start(&self) -> zbus::Result<bool>;
    fn stop(&self) -> zbus::Result<String>;
    fn mark(&self, identity: &str, date: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn attendance(&self) -> zbus::Result<String>;
    fn recent_confirmations(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Attendance ledger CSV (default: $ROLLCALL_LEDGER_PATH or the data dir)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,
    /// Enrolled encodings JSON (default: $ROLLCALL_ENCODINGS_PATH or the data dir)
    #[arg(long, global = true)]
    encodings: Option<PathBuf>,
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the attendance ledger
    Show {
        /// Only list the people present on this date (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Print how many recorded days each person was present
        #[arg(long, conflicts_with = "date")]
        totals: bool,
    },
    /// Mark a person present (manual correction). Goes through the daemon
    /// when it is running.
    Mark {
        identity: String,
        /// Date to mark (default: today)
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// List enrolled identities
    Identities,
    /// Start a recognition session in the daemon
    Start,
    /// Stop the daemon's recognition session
    Stop,
    /// Show daemon status
    Status,
    /// Print the daemon's latest attendance snapshot
    Attendance,
    /// Show recent presence confirmations
    Recent,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let ledger_path = cli.ledger.unwrap_or_else(rollcall_core::default_ledger_path);
    let encodings_path = cli
        .encodings
        .unwrap_or_else(rollcall_core::default_encodings_path);

    match cli.command {
        Commands::Show { date, totals } => {
            let ledger = Ledger::load(&ledger_path)
                .with_context(|| format!("reading {}", ledger_path.display()))?;
            if totals {
                print!("{}", render_totals(&ledger));
                return Ok(());
            }
            match date {
                Some(date) => {
                    let present = ledger.present_on(date);
                    if present.is_empty() {
                        println!("Nobody marked present on {date}");
                    }
                    for identity in present {
                        println!("{identity}");
                    }
                }
                None if ledger.is_empty() => println!("No attendance recorded yet"),
                None => print!("{}", render_table(&ledger)),
            }
        }
        Commands::Mark { identity, date } => {
            let identity = Identity::new(identity)?;
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());

            if let Ok(store) = EncodingStore::load(&encodings_path) {
                if !store.identities().contains(&&identity) {
                    eprintln!("warning: {identity} is not enrolled");
                }
            }

            let newly_marked = match running_daemon(cli.system).await? {
                Some(proxy) => {
                    let raw = proxy.mark(identity.as_str(), &date.to_string()).await?;
                    let outcome: serde_json::Value = serde_json::from_str(&raw)?;
                    if outcome["persisted"] == false {
                        eprintln!("warning: rollcalld could not save the ledger yet; it will retry");
                    }
                    outcome["newly_marked"] == true
                }
                None => {
                    let mut ledger = Ledger::load(&ledger_path)
                        .with_context(|| format!("reading {}", ledger_path.display()))?;
                    let newly_marked = ledger.mark_present(&identity, date);
                    if newly_marked {
                        ledger.save(&ledger_path)?;
                    }
                    newly_marked
                }
            };
            if newly_marked {
                println!("Attendance marked: {identity} on {date}");
            } else {
                println!("{identity} is already marked present on {date}");
            }
        }
        Commands::Identities => {
            let store = EncodingStore::load(&encodings_path)?;
            for identity in store.identities() {
                let samples = store.iter().filter(|(id, _)| *id == identity).count();
                println!("{identity}\t{samples} sample(s)");
            }
        }
        Commands::Start => {
            let proxy = connect(cli.system).await?;
            if proxy.start().await? {
                println!("Recognition started");
            } else {
                println!("Recognition already running");
            }
        }
        Commands::Stop => {
            let proxy = connect(cli.system).await?;
            let summary = proxy.stop().await?;
            if summary == "null" {
                println!("Recognition was not running");
            } else {
                print_json(&summary)?;
            }
        }
        Commands::Status => {
            let proxy = connect(cli.system).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Attendance => {
            let proxy = connect(cli.system).await?;
            let csv = proxy.attendance().await?;
            let ledger = Ledger::parse(csv.as_bytes())?;
            print!("{}", render_table(&ledger));
        }
        Commands::Recent => {
            let proxy = connect(cli.system).await?;
            print_json(&proxy.recent_confirmations().await?)?;
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("rollcalld: not connected")?;
    Ok(AttendanceProxy::new(&connection).await?)
}

/// Proxy to rollcalld if it currently owns its bus name. No reachable bus
/// means no daemon, so the caller may edit the ledger file itself.
async fn running_daemon(system: bool) -> Result<Option<AttendanceProxy<'static>>> {
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    let connection = match connection {
        Ok(connection) => connection,
        Err(e) => {
            tracing::debug!(error = %e, "no message bus, working offline");
            return Ok(None);
        }
    };

    let bus = zbus::fdo::DBusProxy::new(&connection).await?;
    let name = zbus::names::BusName::try_from(BUS_NAME)?;
    if !bus.name_has_owner(name).await? {
        return Ok(None);
    }
    Ok(Some(AttendanceProxy::new(&connection).await?))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Render the ledger as an aligned text table.
fn render_table(ledger: &Ledger) -> String {
    let mut rows: Vec<Vec<String>> = vec![ledger.header()];
    for (identity, cells) in ledger.rows() {
        rows.push(
            std::iter::once(identity.to_string())
                .chain(cells.iter().map(|s| s.to_string()))
                .collect(),
        );
    }

    let columns = rows[0].len();
    let widths: Vec<usize> = (0..columns)
        .map(|c| rows.iter().map(|r| r[c].chars().count()).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!("{cell:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}

/// Days present per person, out of the recorded dates.
fn render_totals(ledger: &Ledger) -> String {
    let total = ledger.dates().len();
    let width = ledger
        .identities()
        .map(|id| id.as_str().chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for identity in ledger.identities() {
        let name = identity.as_str();
        let days = ledger.days_present(identity);
        out.push_str(&format!("{name:<width$}  {days}/{total}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_aligns_columns() {
        let ledger = Ledger::parse(
            b"Name,2024-03-01,2024-03-02\nalice,Present,Absent\nbo,Absent,Present\n",
        )
        .unwrap();
        assert_eq!(
            render_table(&ledger),
            "Name   2024-03-01  2024-03-02\n\
             alice  Present     Absent\n\
             bo     Absent      Present\n"
        );
    }

    #[test]
    fn test_render_totals_counts_present_days() {
        let ledger = Ledger::parse(
            b"Name,2024-03-01,2024-03-02\nalice,Present,Present\nbo,Absent,Present\ncy,Absent,Absent\n",
        )
        .unwrap();
        assert_eq!(render_totals(&ledger), "alice  2/2\nbo     1/2\ncy     0/2\n");
        assert_eq!(render_totals(&Ledger::new()), "");
    }

    #[test]
    fn test_render_table_header_only() {
        assert_eq!(render_table(&Ledger::new()), "Name\n");
    }
}
