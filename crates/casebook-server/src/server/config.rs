use anyhow::bail;
use casebook_wire::{
    casebook::{ClaimStamp, DEFAULT_LEASE_TIMEOUT, DEFAULT_POOL_CAPACITY, SOLVER_ID_CAPACITY},
    server::{DEFAULT_MAX_FETCH, SessionConfig},
};
use clap::Parser;
use std::{path::PathBuf, time::Duration};

/// Runtime configuration for the `casebook-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "casebook-server",
    version,
    about = "Serves a casebook ledger to remote engines over mutual TLS"
)]
pub struct CliArgs {
    /// Ledger file to serve. It must already exist (see `casebook-db init`).
    ///
    /// Environment variable: `CASEBOOK_LEDGER`
    #[arg(env = "CASEBOOK_LEDGER")]
    pub ledger: PathBuf,

    /// Append duplicate reports here as raw 16-byte records.
    ///
    /// Environment variable: `DUPLICATE_LOG`
    #[arg(long, env = "DUPLICATE_LOG")]
    pub duplicate_log: Option<PathBuf>,

    /// Append a timestamped line here for every newly attributed solver.
    ///
    /// Environment variable: `SOLVER_LOG`
    #[arg(long, env = "SOLVER_LOG")]
    pub solver_log: Option<PathBuf>,

    /// Address engines connect to.
    ///
    /// Environment variable: `CLIENT_ADDR`
    #[arg(long, env = "CLIENT_ADDR", default_value_t = String::from("0.0.0.0:27027"))]
    pub client_addr: String,

    /// Address of the plaintext status listener.
    ///
    /// Environment variable: `STATUS_ADDR`
    #[arg(long, env = "STATUS_ADDR", default_value_t = String::from("127.0.0.1:27000"))]
    pub status_addr: String,

    /// Minutes an offered case may stay unsolved before it is offered again.
    ///
    /// Environment variable: `LEASE_TIMEOUT_MINUTES`
    #[arg(
        long,
        env = "LEASE_TIMEOUT_MINUTES",
        default_value_t = DEFAULT_LEASE_TIMEOUT.as_secs() / 60
    )]
    pub lease_timeout_minutes: u64,

    /// Largest case count a single fetch request may ask for. Larger requests
    /// close the session.
    ///
    /// Environment variable: `MAX_FETCH`
    #[arg(long, env = "MAX_FETCH", default_value_t = DEFAULT_MAX_FETCH)]
    pub max_fetch: usize,

    /// Capacity of the ledger's solver ID pool (at most 4096).
    ///
    /// Environment variable: `POOL_CAPACITY`
    #[arg(long, env = "POOL_CAPACITY", default_value_t = DEFAULT_POOL_CAPACITY)]
    pub pool_capacity: usize,

    /// Run a ledger sweep this often, releasing claims that outlived
    /// `--stale-window-minutes`. Disabled when unset.
    ///
    /// Environment variable: `STALE_SWEEP_MINUTES`
    #[arg(long, env = "STALE_SWEEP_MINUTES")]
    pub stale_sweep_minutes: Option<u64>,

    /// Age after which the sweep treats a claim as abandoned. Defaults to
    /// twice the lease timeout; must exceed the lease timeout by at least
    /// four minutes.
    ///
    /// Environment variable: `STALE_WINDOW_MINUTES`
    #[arg(long, env = "STALE_WINDOW_MINUTES")]
    pub stale_window_minutes: Option<u64>,

    /// PEM certificate chain presented to engines.
    ///
    /// Environment variable: `TLS_CERT`
    #[arg(long, env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    ///
    /// Environment variable: `TLS_KEY`
    #[arg(long, env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// PEM bundle of CAs that engine certificates must chain to.
    ///
    /// Environment variable: `TLS_CLIENT_CA`
    #[arg(long, env = "TLS_CLIENT_CA")]
    pub tls_client_ca: Option<PathBuf>,

    /// Serve engines without TLS. Only for trusted networks.
    #[arg(long, default_value_t = false)]
    pub plaintext: bool,

    /// Seconds to wait for open sessions to wind down on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_SECS`
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

/// Certificate material for the client listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: PathBuf,
}

/// Periodic ledger sweep settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleSweep {
    pub interval: Duration,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ledger: PathBuf,
    pub duplicate_log: Option<PathBuf>,
    pub solver_log: Option<PathBuf>,
    pub client_addr: String,
    pub status_addr: String,
    pub lease_timeout: Duration,
    pub session: SessionConfig,
    pub pool_capacity: usize,
    pub stale_sweep: Option<StaleSweep>,
    /// `None` only with `--plaintext`.
    pub tls: Option<TlsFiles>,
    pub shutdown_grace: Duration,
}

const fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.lease_timeout_minutes == 0 {
            bail!("LEASE_TIMEOUT_MINUTES must be greater than 0");
        }
        if args.max_fetch == 0 || i32::try_from(args.max_fetch).is_err() {
            bail!("MAX_FETCH must be in 1..={}", i32::MAX);
        }
        if args.pool_capacity == 0 || args.pool_capacity > SOLVER_ID_CAPACITY {
            bail!(
                "POOL_CAPACITY ({}) must be in 1..={SOLVER_ID_CAPACITY}",
                args.pool_capacity
            );
        }

        let lease_timeout = minutes(args.lease_timeout_minutes);
        // live leases restamp their claim, so a longer window never sees them
        let floor = lease_timeout + ClaimStamp::RESOLUTION;
        let stale_sweep = match (args.stale_sweep_minutes, args.stale_window_minutes) {
            (None, None) => None,
            (None, Some(_)) => bail!("STALE_WINDOW_MINUTES requires STALE_SWEEP_MINUTES"),
            (Some(0), _) | (_, Some(0)) => bail!("stale sweep minutes must be greater than 0"),
            (Some(interval), window) => Some(StaleSweep {
                interval: minutes(interval),
                window: window.map_or((lease_timeout * 2).max(floor), minutes),
            }),
        };
        if stale_sweep.is_some_and(|sweep| sweep.window < floor) {
            bail!(
                "STALE_WINDOW_MINUTES must be at least the lease timeout plus {} minutes",
                ClaimStamp::RESOLUTION.as_secs() / 60
            );
        }

        let tls = match (args.tls_cert, args.tls_key, args.tls_client_ca) {
            (Some(cert), Some(key), Some(client_ca)) if !args.plaintext => Some(TlsFiles {
                cert,
                key,
                client_ca,
            }),
            (None, None, None) if args.plaintext => None,
            _ if args.plaintext => bail!("--plaintext cannot be combined with TLS material"),
            _ => bail!("TLS_CERT, TLS_KEY and TLS_CLIENT_CA are all required"),
        };

        Ok(Self {
            ledger: args.ledger,
            duplicate_log: args.duplicate_log,
            solver_log: args.solver_log,
            client_addr: args.client_addr,
            status_addr: args.status_addr,
            lease_timeout,
            session: SessionConfig {
                max_fetch: args.max_fetch,
            },
            pool_capacity: args.pool_capacity,
            stale_sweep,
            tls,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = ["casebook-server", "ledger.db"].iter().chain(extra);
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    const TLS: [&str; 6] = [
        "--tls-cert",
        "cert.pem",
        "--tls-key",
        "key.pem",
        "--tls-client-ca",
        "ca.pem",
    ];

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = parse(&TLS).unwrap();
        assert_eq!(config.client_addr, "0.0.0.0:27027");
        assert_eq!(config.status_addr, "127.0.0.1:27000");
        assert_eq!(config.lease_timeout, minutes(360));
        assert_eq!(config.session.max_fetch, 4096);
        assert_eq!(config.pool_capacity, 4096);
        assert!(config.stale_sweep.is_none());
        assert_eq!(config.tls.unwrap().client_ca, PathBuf::from("ca.pem"));
    }

    #[test]
    fn tls_material_is_all_or_nothing() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--tls-cert", "cert.pem"]).is_err());
        assert!(parse(&["--plaintext"]).unwrap().tls.is_none());
        let mut mixed = TLS.to_vec();
        mixed.push("--plaintext");
        assert!(parse(&mixed).is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let with = |flag: &str, value: &str| {
            let mut argv = TLS.to_vec();
            argv.extend([flag, value]);
            parse(&argv)
        };
        assert!(with("--lease-timeout-minutes", "0").is_err());
        assert!(with("--pool-capacity", "0").is_err());
        assert!(with("--pool-capacity", "4097").is_err());
        assert!(with("--max-fetch", "0").is_err());
        assert!(with("--stale-window-minutes", "5").is_err());
        assert!(with("--stale-sweep-minutes", "0").is_err());
    }

    #[test]
    fn stale_window_defaults_to_twice_the_lease() {
        let mut argv = TLS.to_vec();
        argv.extend(["--lease-timeout-minutes", "30", "--stale-sweep-minutes", "5"]);
        let sweep = parse(&argv).unwrap().stale_sweep.unwrap();
        assert_eq!(sweep.interval, minutes(5));
        assert_eq!(sweep.window, minutes(60));
    }

    #[test]
    fn stale_window_must_outlast_live_leases() {
        let mut argv = TLS.to_vec();
        argv.extend(["--lease-timeout-minutes", "30", "--stale-sweep-minutes", "5"]);
        let mut short = argv.clone();
        short.extend(["--stale-window-minutes", "33"]);
        assert!(parse(&short).is_err());
        argv.extend(["--stale-window-minutes", "34"]);
        assert_eq!(parse(&argv).unwrap().stale_sweep.unwrap().window, minutes(34));

        let mut tiny = TLS.to_vec();
        tiny.extend(["--lease-timeout-minutes", "1", "--stale-sweep-minutes", "1"]);
        assert_eq!(parse(&tiny).unwrap().stale_sweep.unwrap().window, minutes(5));
    }
}
