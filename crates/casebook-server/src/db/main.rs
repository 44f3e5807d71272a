//! `casebook-db`: offline inspection and maintenance of ledger files.
//!
//! Run it only while no server has the ledger open.

use anyhow::{Context, bail};
use casebook_wire::casebook::{Ledger, MAX_PAYLOAD, MonotonicClock, Record, TimeSource};
use clap::{Parser, Subcommand, ValueEnum};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "casebook-db",
    version,
    about = "Inspect and maintain casebook ledger files"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a fresh ledger holding one unclaimed record per payload.
    Init {
        file: PathBuf,
        /// Case payloads, decimal or `0x`-prefixed hex.
        #[arg(required = true, value_parser = parse_payload)]
        payloads: Vec<u64>,
    },
    /// Print summary counts.
    Stats {
        file: PathBuf,
        /// Emit JSON instead of a text line.
        #[arg(long)]
        json: bool,
    },
    /// Print records, one per line.
    Print {
        file: PathBuf,
        #[arg(default_value_t = 0)]
        start: usize,
        /// Number of records; all remaining when omitted.
        count: Option<usize>,
    },
    /// Release every claimed but unsolved record.
    Untake { file: PathBuf },
    /// Release claims older than the given number of minutes.
    ReclaimStale { file: PathBuf, minutes: u64 },
    /// Copy matching raw records into a new file.
    Slice {
        file: PathBuf,
        out: PathBuf,
        selection: Selection,
        /// Claim age for `stale`.
        minutes: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Selection {
    /// Claimed and unsolved.
    Taken,
    /// Claimed, unsolved and older than `minutes`.
    Stale,
}

fn parse_payload(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    }
    .map_err(|e| format!("{raw}: {e}"))?;
    if parsed == 0 || parsed > MAX_PAYLOAD {
        return Err(format!("{raw}: payload must be in 1..={MAX_PAYLOAD:#x}"));
    }
    Ok(parsed)
}

fn open(path: &Path) -> anyhow::Result<Ledger> {
    Ledger::open(path).with_context(|| format!("cannot open ledger {}", path.display()))
}

/// Writes the raw records selected by `keep` to `out`, returning how many
/// were written.
fn slice(
    ledger: &Ledger,
    out: &Path,
    mut keep: impl FnMut(&Record) -> bool,
) -> anyhow::Result<usize> {
    let file =
        File::create_new(out).with_context(|| format!("cannot create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for record in ledger.records().filter(|r| keep(r)) {
        writer.write_all(&record.to_be_bytes())?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

fn run(command: Command, out: &mut impl Write) -> anyhow::Result<()> {
    match command {
        Command::Init { file, payloads } => {
            let count = payloads.len();
            Ledger::create(&file, payloads)
                .with_context(|| format!("cannot create ledger {}", file.display()))?;
            writeln!(out, "{}: {count} records", file.display())?;
        }
        Command::Stats { file, json } => {
            let stats = open(&file)?.stats();
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&stats)?)?;
            } else {
                writeln!(out, "{stats}")?;
            }
        }
        Command::Print { file, start, count } => {
            let ledger = open(&file)?;
            let records = ledger.records().enumerate().skip(start);
            for (index, record) in records.take(count.unwrap_or(usize::MAX)) {
                writeln!(out, "{index:>10} {record}")?;
            }
        }
        Command::Untake { file } => {
            let ledger = open(&file)?;
            let released = ledger.untake_all();
            ledger.flush()?;
            writeln!(out, "released {released} claims")?;
        }
        Command::ReclaimStale { file, minutes } => {
            let ledger = open(&file)?;
            let window = Duration::from_secs(minutes.saturating_mul(60));
            let released = ledger.reclaim_stale(window);
            ledger.flush()?;
            writeln!(out, "released {released} claims")?;
        }
        Command::Slice {
            file,
            out: target,
            selection,
            minutes,
        } => {
            let ledger = open(&file)?;
            let written = match (selection, minutes) {
                (Selection::Taken, _) => slice(&ledger, &target, Record::is_taken)?,
                (Selection::Stale, Some(minutes)) => {
                    let window = Duration::from_secs(minutes.saturating_mul(60));
                    let now = MonotonicClock::new().current_millis();
                    slice(&ledger, &target, |r| {
                        r.is_taken() && r.stamp().is_older_than(window, now)
                    })?
                }
                (Selection::Stale, None) => bail!("`stale` needs a claim age in minutes"),
            };
            writeln!(out, "{}: {written} records", target.display())?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli.command, &mut std::io::stdout().lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_wire::casebook::{Attributor, Entry};

    fn exec(argv: &[&str]) -> anyhow::Result<String> {
        let argv = std::iter::once("casebook-db").chain(argv.iter().copied());
        let cli = Cli::try_parse_from(argv)?;
        let mut out = Vec::new();
        run(cli.command, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn payloads_accept_hex_and_decimal() {
        assert_eq!(parse_payload("0x1F"), Ok(0x1F));
        assert_eq!(parse_payload("42"), Ok(42));
        assert!(parse_payload("0").is_err());
        assert!(parse_payload("0x100000000000").is_err());
        assert!(parse_payload("cafe").is_err());
    }

    #[test]
    fn init_stats_and_print() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let file = path.to_str().unwrap();

        assert_eq!(
            exec(&["init", file, "0x10", "0x20", "48"]).unwrap(),
            format!("{file}: 3 records\n")
        );
        {
            let ledger = Ledger::open(&path).unwrap();
            let entry = ledger.claim_next().unwrap();
            assert!(entry.solve(&Attributor::shared("t"), 5));
            ledger.claim_next().unwrap();
            ledger.flush().unwrap();
        }

        let stats = exec(&["stats", file, "--json"]).unwrap();
        let json: serde_json::Value = serde_json::from_str(&stats).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["solved"], 1);
        assert_eq!(json["taken"], 1);
        assert_eq!(json["result_sum"], 5);

        let printed = exec(&["print", file, "1", "2"]).unwrap();
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].trim_start().starts_with("1 "));
        assert!(lines[0].contains("TAKEN"));
        assert!(lines[1].trim_start().starts_with("2 "));
    }

    #[test]
    fn slice_and_untake() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let file = path.to_str().unwrap();
        let sliced = dir.path().join("taken.db");
        exec(&["init", file, "1", "2", "3"]).unwrap();
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.claim_next().unwrap();
            ledger.claim_next().unwrap();
            ledger.flush().unwrap();
        }

        exec(&["slice", file, sliced.to_str().unwrap(), "taken"]).unwrap();
        let copy = Ledger::open(&sliced).unwrap();
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.record(1).unwrap().payload(), 2);
        assert!(copy.record(1).unwrap().is_taken());

        // a fresh claim is not stale yet
        let fresh = dir.path().join("stale.db");
        assert!(exec(&["slice", file, fresh.to_str().unwrap(), "stale"]).is_err());
        exec(&["slice", file, fresh.to_str().unwrap(), "stale", "60"]).unwrap();
        assert_eq!(std::fs::metadata(&fresh).unwrap().len(), 0);

        assert_eq!(exec(&["untake", file]).unwrap(), "released 2 claims\n");
        assert_eq!(Ledger::open(&path).unwrap().stats().taken, 0);
    }
}
