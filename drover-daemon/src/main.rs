//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;

use std::path::Path;

use clap::{App, Arg};
use config::{Config, LoggingFmtStyle};
use pickledb::{PickleDb, PickleDbDumpPolicy, SerializationMethod};
use tracing::{debug, info, warn};
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;

use drover_core::events::{ConfigAction, ConfigMsg};
use drover_core::{DriverAgent, NoOverrides, agent_channels, event_loop};
use drover_utils::bus::{BusMsg, BusReceiver, Publication, RpcError};
use drover_utils::task::Task;
use drover_utils::{Database, UnboundedSender};

fn init_tracing(config: &config::Logging) {
    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_file(config.stdout.show_source)
            .with_line_number(config.stdout.show_source)
            .with_ansi(config.stdout.colors);
        match config.stdout.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        }
    });

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("drover=debug".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .init();
}

fn init_db<P: AsRef<Path>>(
    path: P,
) -> Result<PickleDb, pickledb::error::Error> {
    let dump_policy = PickleDbDumpPolicy::AutoDump;
    let serialization_method = SerializationMethod::Json;
    match path.as_ref().exists() {
        true => PickleDb::load(path, dump_policy, serialization_method),
        false => Ok(PickleDb::new(path, dump_policy, serialization_method)),
    }
}

// In-process loopback bus: publications are delivered to local
// subscribers, RPC calls have no peers to reach. A real deployment
// replaces this task with a bus transport speaking the same messages.
fn bus_loopback(mut bus_rx: BusReceiver) -> Task<()> {
    Task::spawn(async move {
        let mut subscribers: Vec<(String, UnboundedSender<Publication>)> =
            vec![];
        while let Some(msg) = bus_rx.recv().await {
            match msg {
                BusMsg::Publish(publication) => {
                    debug!(
                        topic = %publication.topic,
                        payload = %publication.payload,
                        "publish"
                    );
                    subscribers.retain(|(prefix, tx)| {
                        if publication.topic.starts_with(prefix.as_str()) {
                            tx.send(publication.clone()).is_ok()
                        } else {
                            !tx.is_closed()
                        }
                    });
                }
                BusMsg::RpcCall {
                    peer,
                    method,
                    responder,
                    ..
                } => {
                    warn!(%peer, %method, "no route to RPC peer");
                    if let Some(responder) = responder {
                        let _ = responder.send(Err(RpcError(format!(
                            "peer unavailable: {peer}"
                        ))));
                    }
                }
                BusMsg::Subscribe { prefix, tx } => {
                    subscribers.push((prefix, tx));
                }
            }
        }
    })
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("Drover platform driver daemon")
        .version(clap::crate_version!())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = Config::load(config_file);

    // Initialize tracing.
    init_tracing(&config.logging);

    // Initialize non-volatile storage.
    let db = init_db(&config.database_path)
        .expect("failed to initialize non-volatile storage");
    let db: Database = std::sync::Arc::new(std::sync::Mutex::new(db));

    // Set panic handler to abort the process if any child task panics.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // We're ready to go!
    info!("starting up");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(async {
            let (bus_tx, bus_rx) = tokio::sync::mpsc::unbounded_channel();
            let _bus = bus_loopback(bus_rx);

            let (channels_tx, channels_rx) = agent_channels();
            let agent = DriverAgent::new(
                &config.driver,
                bus_tx,
                Some(db),
                Box::new(NoOverrides),
                &channels_tx,
            );
            let mut agent_task =
                Task::spawn(event_loop(agent, channels_rx));
            agent_task.detach();

            // Replay the bootstrap configuration as config-store events.
            let _ = channels_tx
                .config
                .send(ConfigMsg {
                    action: ConfigAction::New,
                    name: "config".to_owned(),
                    contents: config.driver.clone(),
                })
                .await;
            for (name, contents) in &config.equipment {
                let _ = channels_tx
                    .config
                    .send(ConfigMsg {
                        action: ConfigAction::New,
                        name: name.clone(),
                        contents: contents.clone(),
                    })
                    .await;
            }

            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for shutdown signal");
            info!("shutting down");
        });
}
