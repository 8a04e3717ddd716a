//! # Broker Benchmark - Main Entry Point
//!
//! Command-line front end of the benchmark driver.
//!
//! ## Architecture Overview
//!
//! The main function performs these key operations:
//! 1. **Parse arguments**: subcommand, workload overrides and environment
//! 2. **Initialize logging**: colorized console output plus optional log file
//! 3. **Assemble the orchestrator**: transport, platform lifecycle, resource
//!    monitor and results directory, chosen once from the arguments
//! 4. **Run**: a single platform, a comparison, or the whole profile suite
//! 5. **Report**: print the summary table of what was just measured
//!
//! ## Error Handling
//!
//! `anyhow::Result` at this boundary. Configuration errors and platforms that
//! never become ready end the process with a non-zero exit code; failures of
//! individual sends or polls are part of the results instead.

use anyhow::Result;
use broker_benchmark::{
    cli::{parse_platform, Args, Command, OverrideArgs},
    comparison::Improvement,
    config::{find_profile, test_profiles, ConfigOverrides, RunConfiguration, TestProfile},
    monitor::{NoopMonitor, ProcResourceMonitor, ResourceMonitor},
    platform::{ComposeLifecycle, LocalLifecycle, PlatformId, PlatformLifecycle},
    producer::ProgressCallback,
    results::{ComparisonResult, PlatformResult, ResultsManager},
    stats::format,
    utils::{
        create_progress_indicator, format_bytes, format_duration, print_table_row,
        print_table_separator,
    },
    BenchmarkOrchestrator, VERSION,
};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Held until exit so the file appender flushes.
    let _log_guard =
        broker_benchmark::logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting Broker Benchmark v{}", VERSION);
    debug!("Arguments: {:?}", args);

    match &args.command {
        Command::ListTests => {
            list_tests();
            Ok(())
        }
        Command::Report { comparison_file } => {
            let comparison = ResultsManager::load_comparison(comparison_file)?;
            print_comparison(&comparison);
            Ok(())
        }
        Command::Single {
            platform,
            test,
            overrides,
        } => {
            let config = resolve_config(test, overrides)?;
            let mut orchestrator =
                build_orchestrator(&args)?.with_progress(progress_reporter(&config));
            let result = orchestrator.run_single(platform, test, &config).await?;
            print_platform_result(&result);
            Ok(())
        }
        Command::Compare {
            test,
            first,
            second,
            overrides,
        } => {
            let config = resolve_config(test, overrides)?;
            let (first, second) = (parse_platform(first)?, parse_platform(second)?);
            let mut orchestrator =
                build_orchestrator(&args)?.with_progress(progress_reporter(&config));
            let comparison = orchestrator
                .run_comparison(test, &config, first, second)
                .await?;
            print_comparison(&comparison);
            Ok(())
        }
        Command::ThreeWayCompare { test, overrides } => {
            let config = resolve_config(test, overrides)?;
            let mut orchestrator =
                build_orchestrator(&args)?.with_progress(progress_reporter(&config));
            let comparison = orchestrator.run_three_way(test, &config).await?;
            print_comparison(&comparison);
            Ok(())
        }
        Command::All { overrides } => {
            let overrides = ConfigOverrides::from(overrides);
            let profiles = test_profiles()
                .into_iter()
                .map(|profile| TestProfile {
                    config: profile.config.with_overrides(&overrides),
                    ..profile
                })
                .collect::<Vec<_>>();

            let mut orchestrator = build_orchestrator(&args)?;
            let outcomes = orchestrator.run_all(&profiles).await;
            let failures = outcomes.iter().filter(|(_, outcome)| outcome.is_err()).count();
            for (test_name, outcome) in &outcomes {
                match outcome {
                    Ok(comparison) => print_comparison(comparison),
                    Err(e) => println!("{}", format!("{}: {}", test_name, e).red()),
                }
            }
            if failures == outcomes.len() && !outcomes.is_empty() {
                anyhow::bail!("every test profile failed");
            }
            Ok(())
        }
        Command::Start { platform } => {
            let mut orchestrator = build_orchestrator(&args)?;
            orchestrator.start_platform(platform).await?;
            println!("{}", format!("{} is ready", platform).green());
            Ok(())
        }
        Command::Stop { platform } => {
            let mut orchestrator = build_orchestrator(&args)?;
            if orchestrator.stop_platform(platform).await? {
                println!("{}", format!("{} stopped", platform).green());
            } else {
                warn!("Stopping {} reported failure", platform);
            }
            Ok(())
        }
    }
}

/// Look up the profile and apply the command-line overrides.
fn resolve_config(test: &str, overrides: &OverrideArgs) -> Result<RunConfiguration> {
    let profile = find_profile(test)?;
    let config = profile.config.with_overrides(&ConfigOverrides::from(overrides));
    config.validate()?;
    Ok(config)
}

/// Assemble the orchestrator from the environment flags.
///
/// The in-memory transport needs no deployment, so it pairs with the local
/// lifecycle; a real transport drives docker-compose.
fn build_orchestrator(args: &Args) -> Result<BenchmarkOrchestrator> {
    let transport = args.transport.factory()?;
    info!("Using {} transport", args.transport);

    let lifecycle: Box<dyn PlatformLifecycle> = if args.transport.needs_platform() {
        Box::new(ComposeLifecycle::new(&args.project_dir))
    } else {
        Box::new(LocalLifecycle)
    };
    let monitor: Box<dyn ResourceMonitor> = if args.no_monitor {
        Box::new(NoopMonitor)
    } else if args.transport.needs_platform() {
        Box::new(ProcResourceMonitor::default().with_container_stats("docker"))
    } else {
        Box::new(ProcResourceMonitor::default())
    };
    let results = ResultsManager::new(&args.results_dir)?;

    Ok(BenchmarkOrchestrator::new(
        args.registry(),
        lifecycle,
        transport,
        monitor,
        results,
        args.timings(),
    ))
}

fn progress_reporter(config: &RunConfiguration) -> ProgressCallback {
    let expected = config.messages_per_second * config.duration_seconds;
    Arc::new(move |total, last_interval| {
        info!(
            "{} {}/{} sent ({} msg/s)",
            create_progress_indicator(total, expected, 30),
            total,
            expected,
            last_interval
        );
    })
}

fn list_tests() {
    let widths = [12, 10, 10, 10, 8, 10, 6];
    println!("{}", "Available test profiles".bold());
    print_table_separator(&widths);
    print_table_row(
        &["Name", "Duration", "Rate", "Size", "Threads", "Consumers", "Mode"],
        &widths,
    );
    print_table_separator(&widths);
    for profile in test_profiles() {
        let config = &profile.config;
        print_table_row(
            &[
                profile.name,
                &format!("{}s", config.duration_seconds),
                &format!("{}/s", config.messages_per_second),
                &format!("{} B", config.message_size_bytes),
                &config.num_producer_threads.to_string(),
                &config.num_consumers.to_string(),
                &config.delivery_mode.to_string(),
            ],
            &widths,
        );
    }
    print_table_separator(&widths);
}

fn print_platform_result(result: &PlatformResult) {
    println!();
    println!(
        "{}",
        format!("{} - {}", result.platform, result.test_name).bold()
    );

    match &result.producer_stats {
        Some(producer) => {
            println!(
                "  Producer: {} sent ({}), {} failed in {}, {}, {}",
                producer.messages_sent,
                format_bytes(producer.bytes_sent),
                producer.messages_failed,
                format_duration(Duration::from_secs_f64(producer.duration_seconds.max(0.0))),
                format::rate(producer.average_throughput),
                format::bandwidth_mbps(producer.average_bandwidth_mbps)
            );
        }
        None => println!("  Producer: {}", "did not run".yellow()),
    }

    for consumer in &result.consumer_stats {
        println!(
            "  Consumer {}: {} consumed ({}), {}, latency avg {} / p95 {} / p99 {}",
            consumer.consumer_index,
            consumer.messages_consumed,
            format_bytes(consumer.bytes_consumed),
            format::rate(consumer.average_throughput),
            format::latency_ms(consumer.latency_avg_ms),
            format::latency_ms(consumer.latency_p95_ms),
            format::latency_ms(consumer.latency_p99_ms)
        );
    }

    if let Some(metrics) = &result.system_metrics {
        println!(
            "  Resources: CPU avg {:.1}% (max {:.1}%), memory avg {:.1}%",
            metrics.system.cpu_avg, metrics.system.cpu_max, metrics.system.memory_avg
        );
        if let Some(container) = &metrics.container {
            println!(
                "  Container: CPU avg {:.1}% (max {:.1}%), memory avg {:.1}%",
                container.cpu_avg, container.cpu_max, container.memory_avg
            );
        }
    }

    for e in &result.errors {
        println!("  {}", e.red());
    }
}

fn print_comparison(comparison: &ComparisonResult) {
    comparison.print_summary();

    let platforms = comparison.platforms();
    if platforms.len() < 3 {
        return;
    }

    println!();
    for platform in &platforms {
        if let Some(producer) = comparison
            .platform_result(*platform)
            .and_then(|r| r.producer_stats.as_ref())
        {
            println!(
                "{}: {}, {}",
                platform,
                format::rate(producer.average_throughput),
                format::bandwidth_mbps(producer.average_bandwidth_mbps)
            );
        }
    }

    let Some(throughput) = comparison
        .comparison
        .producer
        .as_ref()
        .and_then(|p| p.throughput.as_ref())
    else {
        error!("No producer throughput to compare");
        return;
    };

    let winner = throughput
        .winner
        .parse::<PlatformId>()
        .map(|id| id.to_string())
        .unwrap_or_else(|_| throughput.winner.clone());
    println!("{}", format!("Throughput winner: {}", winner).green().bold());

    let improvement = Improvement::default();
    if let Some(gain) = throughput.value(&improvement.key()) {
        println!(
            "{} vs {} improvement: {:.2}%",
            improvement.subject, improvement.baseline, gain
        );
    }
}
