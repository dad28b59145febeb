use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::{debug, error, info, trace, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use relayci::conf::{load_pipeline, load_pipelines, pipeline_files};
use relayci::summary::render_summary;
use relayci::watch::RepositoryWatcher;
use relayci::{Engine, Event, EventKind, EventOutcome, JobGraph, Pipeline, RunnerConfig, SecretStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG: &str = "relay-ci.toml";

#[tokio::main]
async fn main() {
    let matches = app().get_matches();
    init_logging(matches.occurrences_of("verbose"));
    let code = match dispatch(&matches).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            2
        }
    };
    process::exit(code);
}

fn app() -> App<'static, 'static> {
    App::new("relay-ci")
        .version(VERSION)
        .about("A declarative CI/CD pipeline runner")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Sets the runner config file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("pipelines")
                .short("p")
                .long("pipelines")
                .value_name("DIR")
                .help("Overrides the directory pipelines are read from")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Logs more; repeat for even more"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Runs the pipelines an event triggers")
                .arg(
                    Arg::with_name("event")
                        .short("e")
                        .long("event")
                        .value_name("KIND")
                        .help("push or pull_request")
                        .takes_value(true)
                        .default_value("push"),
                )
                .arg(
                    Arg::with_name("branch")
                        .short("b")
                        .long("branch")
                        .value_name("BRANCH")
                        .help("Pushed branch, or the pull request's target branch")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("commit")
                        .long("commit")
                        .value_name("SHA")
                        .takes_value(true)
                        .default_value("HEAD"),
                )
                .arg(
                    Arg::with_name("repo")
                        .long("repo")
                        .value_name("URL")
                        .help("Clones this repository into every job's workspace")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("json")
                        .long("json")
                        .help("Prints the outcome as JSON instead of a summary"),
                ),
        )
        .subcommand(
            SubCommand::with_name("validate")
                .about("Checks every pipeline file and prints its job order"),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Polls the configured repositories and runs pipelines on new commits"),
        )
}

fn init_logging(verbosity: u64) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    match (verbosity, std::env::var("RUST_LOG")) {
        (0, Ok(filters)) => {
            builder.parse_filters(&filters);
        }
        (0, Err(_)) => {
            builder.filter_level(LevelFilter::Info);
        }
        (1, _) => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    let _ = builder.try_init();
}

async fn dispatch(matches: &ArgMatches<'_>) -> Result<i32> {
    let mut config = read_config(matches)?;
    if let Some(dir) = matches.value_of("pipelines") {
        config.pipelines_dir = PathBuf::from(dir);
    }
    debug!("config: {:#?}", config);
    match matches.subcommand() {
        ("run", Some(sub)) => run(&config, sub).await,
        ("validate", Some(_)) => Ok(validate(&config.pipelines_dir)),
        ("watch", Some(_)) => watch(&config).await,
        (other, _) => Err(anyhow!("unknown subcommand {}", other)),
    }
}

/// The default config file is optional; an explicitly given one is not
fn read_config(matches: &ArgMatches<'_>) -> Result<RunnerConfig> {
    let path = Path::new(matches.value_of("config").unwrap_or(DEFAULT_CONFIG));
    if matches.occurrences_of("config") == 0 && !path.exists() {
        debug!("no {} found, using defaults", path.display());
        return Ok(RunnerConfig::default());
    }
    Ok(RunnerConfig::from_file(path)?)
}

async fn run(config: &RunnerConfig, sub: &ArgMatches<'_>) -> Result<i32> {
    let kind: EventKind = sub
        .value_of("event")
        .unwrap_or("push")
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let branch = sub
        .value_of("branch")
        .ok_or_else(|| anyhow!("--branch is required"))?;
    let event = Event::new(kind, branch, sub.value_of("commit").unwrap_or("HEAD"));
    let pipelines = load_pipelines(&config.pipelines_dir);

    let mut engine = Engine::new(config, SecretStore::from_env());
    if let Some(repo) = sub.value_of("repo") {
        engine = engine.with_repository(repo);
    }
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running jobs");
            on_interrupt.cancel();
        }
    });

    let outcome = engine.run_event(&pipelines, &event, &cancel).await;
    report(&outcome, sub.is_present("json"))?;
    Ok(if outcome.succeeded() { 0 } else { 1 })
}

fn report(outcome: &EventOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        print!("{}", render_summary(outcome)?);
    }
    Ok(())
}

fn validate(dir: &Path) -> i32 {
    let files = pipeline_files(dir);
    if files.is_empty() {
        warn!("no pipeline file in {}", dir.display());
    }
    let mut invalid = 0;
    for file in files {
        let checked = load_pipeline(&file)
            .map_err(anyhow::Error::from)
            .and_then(|p: Pipeline| {
                let graph = JobGraph::build(&p.definition)?;
                Ok((p, graph))
            });
        match checked {
            Ok((p, graph)) => {
                let order: Vec<&str> = graph
                    .topological_order()
                    .iter()
                    .map(|j| j.name.as_str())
                    .collect();
                println!("ok       {} \"{}\": {}", file.display(), p.name(), order.join(" -> "));
            }
            Err(e) => {
                invalid += 1;
                println!("invalid  {}: {:#}", file.display(), e);
            }
        }
    }
    if invalid > 0 {
        1
    } else {
        0
    }
}

async fn watch(config: &RunnerConfig) -> Result<i32> {
    debug!("watch() called with config {:#?}", config);
    if config.repositories.is_empty() {
        return Err(anyhow!("no repository to watch, add some to the config file"));
    }
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    let mut watchers = config
        .repositories
        .iter()
        .cloned()
        .map(RepositoryWatcher::new)
        .collect::<Result<Vec<_>>>()?;
    let pipelines = load_pipelines(&config.pipelines_dir);
    let engine = Engine::new(config, SecretStore::from_env());

    // a termination request also cancels whatever is running
    let cancel = CancellationToken::new();
    {
        let term = Arc::clone(&term);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while !term.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            cancel.cancel();
        });
    }

    let wait_period = Duration::from_secs(config.watch_interval);
    let mut failures = 0;
    while !term.load(Ordering::Relaxed) {
        for w in watchers.iter_mut() {
            let events = match w.poll().await {
                Ok(events) => events,
                Err(e) => {
                    error!("could not poll {}: {:#}", w.name(), e);
                    continue;
                }
            };
            for event in events {
                if cancel.is_cancelled() {
                    break;
                }
                info!("Detected change in {}#{}!", w.name(), event.branch);
                let outcome = engine
                    .clone()
                    .with_repository(w.uri())
                    .run_event(&pipelines, &event, &cancel)
                    .await;
                if !outcome.succeeded() {
                    failures += 1;
                }
                print!("{}", render_summary(&outcome)?);
            }
        }
        trace!("Waiting {:?}", wait_period);
        tokio::select! {
            _ = tokio::time::sleep(wait_period) => {}
            _ = cancel.cancelled() => {}
        }
    }
    info!("Exiting, {} failed run(s) while watching", failures);
    Ok(0)
}
