//! Demo bot: joins a room, answers a couple of commands, exits cleanly on
//! request.

use clap::Parser;
use conclave::{Conn, DiskDb, EventKind, Options};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave-bot", version, about = "Conclave demo bot")]
struct Args {
    /// Room to join
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Nickname to join with
    #[arg(long, default_value = "ConclaveBot")]
    nick: String,

    /// Gateway WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8009/ws")]
    url: String,

    /// Persist identity and room state under this directory
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let db = match &args.store {
        Some(path) => match DiskDb::open(path) {
            Ok(db) => Some(Arc::new(db) as Arc<dyn conclave::Database>),
            Err(e) => {
                error!(error = %e, "cannot open store");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let conn = Conn::new(Options {
        url: args.url.clone(),
        db,
        ..Default::default()
    });

    {
        let conn = conn.clone();
        let room = args.room.clone();
        let nick = args.nick.clone();
        conn.clone().on(EventKind::Connected, move |_| {
            info!("connected");
            let conn = conn.clone();
            let room = room.clone();
            let nick = nick.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.join_room(&room, &nick).await {
                    error!(error = %e, "join failed");
                    conn.disconnect();
                }
            });
        });
    }

    conn.on(EventKind::RoomJoined, |event| {
        info!(room = %event.room, "room joined");
    });

    {
        let conn = conn.clone();
        conn.clone().on(EventKind::NicknameInUse, move |_| {
            error!("nickname is in use");
            conn.disconnect();
        });
    }

    conn.on(EventKind::Disconnected, |_| {
        info!("disconnected, retrying");
    });

    {
        let conn = conn.clone();
        conn.clone().on(EventKind::GroupMessage, move |event| {
            let conn = conn.clone();
            tokio::spawn(async move {
                match event.body.as_str() {
                    "ping" => {
                        let _ = conn
                            .gm(&event.room, &format!("pong, {}!", event.user))
                            .await;
                    }
                    "!quit" => {
                        let _ = conn.gm(&event.room, "goodbye").await;
                        conn.disconnect();
                    }
                    _ => {}
                }
            });
        });
    }

    match conn.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}
