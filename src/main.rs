use anyhow::{Context, anyhow};
use clap::{Arg, ArgMatches, Command, value_parser};
use linepipe::config::{AppConfig, app_name, version};
use linepipe::generator;
use linepipe::http::StreamServer;
use linepipe::pipeline::{
    FileSource, LineBufferedRecordFilter, PipelineOrchestrator, PipelineReport, PipelineStage,
    PipelineState, RecordPredicate, WriterSink,
};
use log::{error, info};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use tokio_util::sync::CancellationToken;

fn main() {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        // first Ctrl-C cancels in-flight pipelines, a second one exits hard
        if let Err(e) = ctrlc::set_handler(move || {
            if shutdown.is_cancelled() {
                process::exit(130);
            }
            shutdown.cancel();
        }) {
            error!("Error setting Ctrl-C handler: {}", e);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(matches, shutdown)) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("JSON configuration file")
        .value_parser(value_parser!(PathBuf))
        .global(true);

    Command::new(app_name())
        .version(version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg(config_arg)
        .subcommand(
            pipeline_args(Command::new("filter").about("Filter an NDJSON file into a file or stdout"))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("PATH")
                        .help("Destination file, or - for stdout")
                        .default_value("-"),
                ),
        )
        .subcommand(
            pipeline_args(Command::new("serve").about("Stream the filtered file to HTTP clients"))
                .arg(
                    Arg::new("listen")
                        .short('l')
                        .long("listen")
                        .value_name("ADDR")
                        .help("Address to listen on")
                        .value_parser(value_parser!(SocketAddr)),
                ),
        )
        .subcommand(
            Command::new("generate")
                .about("Generate NDJSON test data")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("PATH")
                        .default_value("huge_data.json")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("records")
                        .short('n')
                        .long("records")
                        .value_name("COUNT")
                        .default_value("1000000")
                        .value_parser(value_parser!(u64)),
                ),
        )
}

/// Flags shared by every command that runs a pipeline
fn pipeline_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("PATH")
                .help("NDJSON source file")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("chunk-size")
                .long("chunk-size")
                .value_name("BYTES")
                .help("Read size of the source")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("high-water-mark")
                .long("high-water-mark")
                .value_name("BYTES")
                .help("Sink buffer size at which the source is paused")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("throttle-ms")
                .long("throttle-ms")
                .value_name("MILLIS")
                .help("Delay between drain and resume")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("field")
                .long("field")
                .value_name("NAME")
                .help("Record field to match"),
        )
        .arg(
            Arg::new("equals")
                .long("equals")
                .value_name("JSON")
                .help("Value the field must equal; plain text is taken as a string"),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<AppConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    if let Some(path) = matches.get_one::<PathBuf>("input") {
        config.source.path = path.clone();
    }
    if let Some(size) = matches.get_one::<usize>("chunk-size") {
        config.source.chunk_size = *size;
    }
    if let Some(mark) = matches.get_one::<usize>("high-water-mark") {
        config.sink.high_water_mark = *mark;
        config.sink.max_buffered_bytes = config.sink.max_buffered_bytes.max(*mark);
    }
    if let Some(ms) = matches.get_one::<u64>("throttle-ms") {
        config.backpressure.throttle_ms = Some(*ms);
    }
    if let Some(field) = matches.get_one::<String>("field") {
        config.filter.field = field.clone();
    }
    if let Some(raw) = matches.get_one::<String>("equals") {
        config.filter.equals =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
    }

    config.validate()?;
    Ok(config)
}

async fn run(matches: ArgMatches, shutdown: CancellationToken) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("filter", args)) => {
            let config = load_config(args)?;
            let output = args
                .get_one::<String>("output")
                .cloned()
                .unwrap_or_else(|| "-".to_string());
            run_filter(config, &output, &shutdown).await
        }
        Some(("serve", args)) => {
            let mut config = load_config(args)?;
            if let Some(addr) = args.get_one::<SocketAddr>("listen") {
                config.server.listen = *addr;
            }
            StreamServer::bind(config, shutdown).await?.run().await
        }
        Some(("generate", args)) => {
            let path = args
                .get_one::<PathBuf>("output")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("huge_data.json"));
            let records = args.get_one::<u64>("records").copied().unwrap_or(1_000_000);
            generator::generate_file(path, records)
        }
        _ => Err(anyhow!("unknown command")),
    }
}

async fn run_filter(
    config: AppConfig,
    output: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let source = FileSource::open(&config.source.path, config.source.chunk_size)
        .await
        .context("opening source")?;

    let filter = LineBufferedRecordFilter::new(RecordPredicate::from(&config.filter));
    let orchestrator = PipelineOrchestrator::new(config.pipeline_config())
        .with_parent(shutdown)
        .observe_filter(filter.counters());
    let stages: Vec<Box<dyn PipelineStage>> = vec![Box::new(filter)];

    let handle = if output == "-" {
        let sink = WriterSink::named("StdoutSink", tokio::io::stdout(), config.sink.clone());
        orchestrator.connect(source, stages, sink)
    } else {
        let file = tokio::fs::File::create(output)
            .await
            .with_context(|| format!("creating {}", output))?;
        let sink = WriterSink::named("FileSink", file, config.sink.clone());
        orchestrator.connect(source, stages, sink)
    };

    summarize(handle.wait().await?)
}

fn summarize(report: PipelineReport) -> anyhow::Result<()> {
    info!("{}", report.health);
    if let Some(stats) = report.filter {
        info!("{}", stats);
    }

    match (report.state, report.error) {
        (PipelineState::Finished, _) => Ok(()),
        (_, Some(e)) => Err(anyhow!("pipeline failed: {}", e)),
        (state, None) => Err(anyhow!("pipeline {}", state.description().to_lowercase())),
    }
}
