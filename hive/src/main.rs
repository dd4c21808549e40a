use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hive::libdocker;
use hive::libhive::data::SimEnv;
use hive::libhive::inventory::{parse_client_list, Inventory};
use hive::libhive::run::{Runner, SimRun};
use hive::libhive::HiveError;

#[derive(Parser)]
#[command(name = "hive", about = "End-to-end test orchestrator for Ethereum clients")]
struct Args {
    /// Comma separated list of clients to build, with optional
    /// `_f:<dockerfile>`, `_u:<user>`, `_r:<repo>` and branch suffixes.
    #[arg(long, default_value = "go-ethereum")]
    client: String,

    /// Regular expression selecting the simulators to run.
    #[arg(long)]
    sim: Option<String>,

    /// Filters test cases inside a simulator by `<suite>/<test>`.
    #[arg(long = "sim.limit", default_value = "")]
    sim_limit: String,

    /// Number of tests the simulator may run in parallel.
    #[arg(long = "sim.parallelism", default_value_t = 1)]
    sim_parallelism: u32,

    /// Log level passed to the simulator and, by default, to started clients.
    #[arg(long = "sim.loglevel", default_value_t = 3)]
    sim_loglevel: u32,

    /// Kills the simulation after this duration. No limit when unset.
    #[arg(long = "sim.timelimit", value_parser = parse_duration)]
    sim_timelimit: Option<Duration>,

    /// Caps the number of test cases per suite. `0` means unlimited.
    #[arg(long = "sim.testlimit", default_value_t = 0)]
    sim_testlimit: usize,

    /// How long to wait for a started client to open its liveness port.
    #[arg(long = "client.checktimeout", value_parser = parse_duration, default_value = "3m")]
    client_checktimeout: Duration,

    /// Endpoint of the docker daemon. Empty selects the platform default.
    #[arg(long = "docker.endpoint", default_value = "")]
    docker_endpoint: String,

    /// Regular expression selecting image tags to rebuild without cache.
    #[arg(long = "docker.nocache")]
    docker_nocache: Option<String>,

    /// Forces pulling of base images when building.
    #[arg(long = "docker.pull", default_value_t = false)]
    docker_pull: bool,

    /// Mirror container output onto stderr, tagged with the container id.
    #[arg(long = "docker.output", default_value_t = false)]
    docker_output: bool,

    /// Mirror docker build output onto stderr.
    #[arg(long = "docker.buildoutput", default_value_t = false)]
    docker_buildoutput: bool,

    /// Removes leftover containers of earlier hive runs before starting.
    #[arg(long = "docker.cleanup", default_value_t = false)]
    docker_cleanup: bool,

    /// Directory where test results and logs are written.
    #[arg(long = "results-root", default_value = "./workspace/logs")]
    results_root: PathBuf,

    /// Simulator development mode. Runs the API on a host endpoint and
    /// waits for an out-of-band simulator process instead of launching one.
    #[arg(long, default_value_t = false)]
    dev: bool,

    /// Endpoint of the local API server in dev mode.
    #[arg(long = "dev.addr", default_value = "127.0.0.1:3000")]
    dev_addr: SocketAddr,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hive=info")),
        )
        .init();

    let args = Args::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "can't start async runtime");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run(args)) {
        Ok(runs) => {
            let failed: u32 = runs.iter().map(|r| r.result.tests_failed).sum();
            let cut_short = runs.iter().any(|r| r.end_reason.is_some());
            if failed > 0 || cut_short {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!("{err}");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<Vec<SimRun>, HiveError> {
    let inventory = Inventory::load(".")?;

    let nocache_pattern = match &args.docker_nocache {
        Some(pat) => Some(regex::Regex::new(pat).map_err(|err| {
            HiveError::Other(format!("bad --docker.nocache pattern: {err}"))
        })?),
        None => None,
    };

    let simulators = match &args.sim {
        Some(pattern) => inventory.match_simulators(pattern)?,
        None => Vec::new(),
    };
    if simulators.is_empty() && !args.dev {
        return Err(HiveError::Other("no simulators for pattern".to_string()));
    }

    let clients = parse_client_list(&args.client);

    let config = libdocker::Config {
        inventory: inventory.clone(),
        nocache_pattern,
        pull_enabled: args.docker_pull,
        print_container_output: args.docker_output,
        print_build_output: args.docker_buildoutput,
    };
    let (builder, backend) = libdocker::connect(&args.docker_endpoint, config).await?;

    if args.docker_cleanup {
        let removed =
            backend.cleanup_containers(&libdocker::CleanupOptions::default()).await?;
        info!(removed, "cleaned up leftover containers");
    }

    let mut runner = Runner::new(inventory, Arc::new(builder), Arc::new(backend));
    runner.build(&clients, &simulators).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let env = SimEnv {
        log_dir: args.results_root.clone(),
        sim_log_level: args.sim_loglevel,
        sim_parallelism: args.sim_parallelism,
        sim_test_pattern: args.sim_limit.clone(),
        sim_duration_limit: args.sim_timelimit,
        print_container_output: args.docker_output,
        client_start_timeout: args.client_checktimeout,
        test_limit: (args.sim_testlimit > 0).then_some(args.sim_testlimit),
    };

    if args.dev {
        runner.run_dev_mode(&cancel, env, args.dev_addr).await?;
        return Ok(Vec::new());
    }

    let mut runs = Vec::new();
    for sim in &simulators {
        let run = runner.run(&cancel, sim, env.clone()).await?;
        info!(
            simulator = sim.as_str(),
            suites = run.result.suites,
            tests = run.result.tests,
            failed = run.result.tests_failed,
            "simulation finished"
        );
        if let Some(reason) = &run.end_reason {
            warn!(simulator = sim.as_str(), %reason, "simulation ended early");
        }
        runs.push(run);
        if cancel.is_cancelled() {
            break;
        }
    }
    Ok(runs)
}

/// Parses `90s`, `5m`, `1h` or a bare number of seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(pos) => value.split_at(pos),
        None => (value, "s"),
    };
    let amount: f64 = number.parse().map_err(|_| format!("invalid duration {value:?}"))?;
    let seconds = match unit {
        "s" | "" => amount,
        "m" => amount * 60.0,
        "h" => amount * 3600.0,
        _ => return Err(format!("invalid duration unit {unit:?}")),
    };
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
