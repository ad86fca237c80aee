use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use courier_broker::adapters::build_adapter;
use courier_broker::health::{run_health_check, HealthReport, ProbeKind};
use courier_broker::in_memory::{InMemoryLogBroker, InMemoryQueueBroker};
use courier_broker::BrokerAdapter;
use courier_config::{BrokerConfig, ConfigError, KafkaArgs, RabbitMqArgs};
use courier_models::errors::{RuntimeError, SendableError};
use courier_utilities::logger::LogSettings;
use courier_utilities::startup::startup;
use log::LevelFilter;

#[derive(Debug, Parser)]
#[command(
    name = "courier-broker",
    about = "Connectivity checks for the courier message brokers"
)]
struct Cli {
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    /// Also append log lines to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Connect, declare a throwaway unit, round-trip a probe and clean up.
    Check {
        /// Print connection coordinates and server details.
        #[arg(long, global = true, default_value_t = false)]
        detailed: bool,

        /// Seconds allowed for connecting, acknowledgements and the probe read.
        #[arg(
            long,
            global = true,
            default_value_t = 10,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        timeout: u64,

        #[command(subcommand)]
        target: Target,
    },
}

#[derive(Debug, Subcommand)]
enum Target {
    Kafka(KafkaArgs),
    Rabbitmq(RabbitMqArgs),
    /// In-process broker, useful to verify the binary itself.
    Memory {
        #[arg(long, value_enum, default_value_t = MemoryModel::Log)]
        model: MemoryModel,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MemoryModel {
    Log,
    Queue,
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let cli = Cli::parse();
    startup(
        "courier-broker",
        &LogSettings {
            level: cli.log_level,
            file: cli.log_file.clone(),
        },
    )?;

    match cli.command {
        Commands::Check {
            detailed,
            timeout,
            target,
        } => check(target, detailed, timeout).await,
    }
}

async fn check(target: Target, detailed: bool, timeout_seconds: u64) -> Result<(), SendableError> {
    let timeout = Duration::from_secs(timeout_seconds);

    let (name, report) = match target {
        Target::Kafka(args) => {
            let config = BrokerConfig::Kafka(args.into_config(timeout_seconds).map_err(invalid)?);
            let report =
                run_health_check(|| build_adapter(&config), ProbeKind::Topic, timeout).await;
            ("kafka", report)
        }
        Target::Rabbitmq(args) => {
            let config =
                BrokerConfig::RabbitMq(args.into_config(timeout_seconds).map_err(invalid)?);
            let report =
                run_health_check(|| build_adapter(&config), ProbeKind::Queue, timeout).await;
            ("rabbitmq", report)
        }
        Target::Memory {
            model: MemoryModel::Log,
        } => {
            let broker = InMemoryLogBroker::new();
            let report = run_health_check(
                || Ok(Box::new(broker.adapter()) as Box<dyn BrokerAdapter>),
                ProbeKind::Topic,
                timeout,
            )
            .await;
            ("memory-log", report)
        }
        Target::Memory {
            model: MemoryModel::Queue,
        } => {
            let broker = InMemoryQueueBroker::new();
            let report = run_health_check(
                || Ok(Box::new(broker.adapter()) as Box<dyn BrokerAdapter>),
                ProbeKind::Queue,
                timeout,
            )
            .await;
            ("memory-queue", report)
        }
    };

    print_report(name, &report, detailed);
    if report.is_healthy() {
        Ok(())
    } else {
        Err(RuntimeError::new(
            format!("health.{name}.failed"),
            format!("{name} is not healthy"),
        )
        .boxed())
    }
}

fn print_report(name: &str, report: &HealthReport, detailed: bool) {
    println!("Testing {name}...");
    print!("{report}");
    if detailed {
        for (key, value) in &report.details {
            println!("    {key}: {value}");
        }
    }
    if report.is_healthy() {
        println!("{name} is healthy");
    }
}

fn invalid(err: ConfigError) -> SendableError {
    RuntimeError::new("health.config.invalid", err.to_string()).boxed()
}
