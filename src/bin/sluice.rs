// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use sluice::protocol::{Packet, PacketFilterFactory};
use sluice::service::{
    setup_local_tracing, setup_tracing, AppHandler, AppServer, CloseReason, ServerConfig,
};
use sluice::{AppError, AppResult, Session};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files, console only when absent
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Answers every packet with an empty reply of the same type.
struct EchoHandler;

impl AppHandler for EchoHandler {
    type Message = Packet;

    async fn handle(&self, session: &Arc<Session>, packet: Packet) -> AppResult<()> {
        info!(
            session_id = session.id(),
            main_type = packet.header.main_type,
            sub_type = packet.header.sub_type,
            "received: {}",
            packet.body_text()
        );
        session.send(packet.reply().encode()).await
    }

    fn on_new_session_connected(&self, session: &Arc<Session>) {
        info!("client {} connected", session.remote_addr());
    }

    fn on_session_closed(&self, session: &Arc<Session>, reason: CloseReason) {
        info!("client {} left: {}", session.remote_addr(), reason);
    }

    fn on_started(&self) {
        info!("echo server started");
    }

    fn on_stopped(&self) {
        info!("echo server stopped");
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline = CommandLine::parse();
    if std::env::var("RUST_LOG").is_err() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let config = ServerConfig::set_up_config(&config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _tracing_guard = match &commandline.log_dir {
        Some(log_dir) => Some(setup_tracing(log_dir)),
        None => {
            setup_local_tracing();
            None
        }
    };

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("sluice-worker")
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let server = AppServer::new(PacketFilterFactory, EchoHandler);
        server.setup(config)?;
        server.start().await?;

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| AppError::DetailedIoError(format!("waiting for ctrl-c: {}", e)))?;
        info!("ctrl-c received, stopping");

        if let Err(e) = server.stop().await {
            error!("failed to stop server: {}", e);
        }
        Ok(())
    })
}
