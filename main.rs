/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::process::ExitCode;

use faultshell::runtime::cli::{self, drill_options};
use faultshell::runtime::drill;
use faultshell::runtime::{ChannelSink, ChaosOrchestrator, SetupOptions};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

fn main() -> ExitCode {
    cli::init_tracing();
    let options = drill_options().run();

    if options.list_variants {
        print!("{}", cli::variant_listing());
        return ExitCode::SUCCESS;
    }

    let settings = cli::resolve_settings(&options, std::env::vars());
    if options.dump_config {
        return match cli::dump_settings(&settings) {
            Ok(dumped) => {
                print!("{dumped}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("main: could not encode settings: {err}");
                ExitCode::FAILURE
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("main: could not start the async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let targets = match cli::resolve_targets(&options) {
            Ok(targets) => targets,
            Err(err) => {
                error!("main: drill targets: {err}");
                return ExitCode::FAILURE;
            }
        };
        let real = match drill::drill_platform() {
            Ok(platform) => platform,
            Err(err) => {
                error!("main: drill platform: {err}");
                return ExitCode::FAILURE;
            }
        };
        let real = match drill::connect_live(real, &targets) {
            Ok(platform) => platform,
            Err(err) => {
                error!("main: {err}");
                return ExitCode::FAILURE;
            }
        };
        let (sink, entries) = ChannelSink::unbounded();
        let orchestrator =
            ChaosOrchestrator::setup(real, SetupOptions::from_settings(settings).with_sink(sink));

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("main: interrupted, finishing the current round");
                on_interrupt.cancel();
            }
        });

        let (stats, elapsed) =
            drill::run(orchestrator.platform().clone(), targets, options.rounds, cancel).await;
        let report = orchestrator.destroy();

        let logged: Vec<_> = entries.try_iter().collect();
        for entry in &logged {
            println!("{}", drill::format_entry(entry, options.json));
        }
        if !options.json {
            println!(
                "{} rounds, {} operations, {} failed, {} faults in {:.2?}",
                stats.rounds,
                stats.operations,
                stats.failures,
                logged.len(),
                elapsed
            );
            for (category, count) in drill::summarize(&logged) {
                println!("  {category:<16} {count}");
            }
        }
        info!("main: {} interceptors cleaned up", report.cleaned.len());

        if report.is_clean() {
            ExitCode::SUCCESS
        } else {
            for failure in &report.failures {
                error!("main: {failure}");
            }
            ExitCode::FAILURE
        }
    })
}
