use clap::{Arg, Command};
use log::LevelFilter;
use mailsift::input::{count_candidates, discover_sources, InputReader};
use mailsift::lookup::Collaborators;
use mailsift::proxy::ProxyPool;
use mailsift::{BatchScheduler, Config, RecordMachine};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("mailsift")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bulk email address validation with checkpointed, resumable batches")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("mailsift.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("DIR")
                .help("Directory of address:secret list files (overrides config)"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Directory for verdict buckets and reports (overrides config)"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("N")
                .help("Concurrent validations per batch (overrides config)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("batch-size")
                .short('b')
                .long("batch-size")
                .value_name("N")
                .help("Records per checkpointed batch (overrides config)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging with per-stage diagnostics")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("mailsift.yaml");

    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if let Some(dir) = matches.get_one::<String>("input") {
        config.paths.input_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.get_one::<String>("output") {
        config.paths.output_dir = PathBuf::from(dir);
    }
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.processing.workers = *workers;
    }
    if let Some(batch_size) = matches.get_one::<usize>("batch-size") {
        config.processing.batch_size = *batch_size;
    }

    if matches.get_flag("test-config") {
        println!("🔍 Testing configuration...");
        println!();
        match config.validate() {
            Ok(()) => {
                println!("Input directory: {}", config.paths.input_dir.display());
                println!("Output directory: {}", config.paths.output_dir.display());
                println!(
                    "Batch size: {}, workers: {}",
                    config.processing.batch_size, config.processing.workers
                );
                println!("Geolocation providers: {}", config.network.geo_providers.len());
                println!("✅ Configuration is valid");
            }
            Err(e) => {
                println!("❌ Configuration validation failed:");
                println!("Error: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        process::exit(1);
    }

    match run(config).await {
        Ok(halted) => {
            if halted {
                process::exit(1);
            }
        }
        Err(e) => {
            log::error!("Run failed: {e:#}");
            process::exit(1);
        }
    }
}

/// Returns whether the run halted on a persistence failure.
async fn run(config: Config) -> anyhow::Result<bool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, finishing the current batch...");
        flag.store(true, Ordering::SeqCst);
    })?;

    let sources = discover_sources(&config.paths.input_dir, &config.paths.proxy_file)?;
    if sources.is_empty() {
        log::warn!(
            "No input files found in {}",
            config.paths.input_dir.display()
        );
    }
    let expected = count_candidates(&sources)?;
    log::info!(
        "Starting validation of {expected} records from {} files",
        sources.len()
    );

    let proxies = Arc::new(ProxyPool::from_file(&config.proxy_path(), &config.proxy)?);
    let collaborators = Collaborators::from_config(&config)?;
    let machine = RecordMachine::new(&config, collaborators, proxies)?;
    let scheduler = BatchScheduler::new(&config, machine, shutdown);

    let summary = scheduler
        .run(InputReader::new(sources), Some(expected))
        .await?;

    println!();
    print!("{summary}");
    log::info!("Results saved to {}", config.paths.output_dir.display());
    Ok(summary.is_halted())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
