mod command;
mod event;
mod ui;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt};

use sidedrop_core::channel::ChannelFactory;
use sidedrop_engine::engine::{Engine, EngineCmd, EngineConfig};
use sidedrop_engine::quic::QuicChannelFactory;
use sidedrop_engine::tcp::TcpChannelFactory;

use crate::command::{
    handle_answer_cmd, handle_close_cmd, handle_offer_cmd, handle_send_cmd, handle_take_cmd,
};
use crate::event::spawn_event_printer;
use crate::ui::{print_banner, print_help, print_prompt, read_line};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    /// Encrypted QUIC channel with a per-offer pinned certificate.
    Quic,
    /// Plaintext TCP — loopback and trusted networks only.
    Tcp,
}

/// sidedrop — peer-to-peer file hand-off.
///
/// Exchange a short offer/answer pair with the other party out of band
/// (chat, email, a shouted code), then the file moves directly between
/// the two machines.  No relay ever holds the data.
#[derive(Parser, Debug)]
#[command(name = "sidedrop", version, about)]
struct Args {
    /// Transport for the peer channel.
    #[arg(short, long, value_enum, default_value = "quic")]
    transport: Transport,

    /// Address offers bind their endpoint on.  Use an externally
    /// reachable IP when the peer is on another machine.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Directory where received files are stored.
    #[arg(short, long, default_value = "/tmp/sidedrop")]
    receive_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.  Default to "warn" for library crates so
    // only the CLI's own output is visible.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sidedrop=info,warn")),
        )
        .init();

    if let Err(e) = std::fs::create_dir_all(&args.receive_dir) {
        eprintln!(
            "Failed to create receive directory {}: {e}",
            args.receive_dir.display()
        );
        std::process::exit(1);
    }

    let config = EngineConfig {
        receive_dir: args.receive_dir.clone(),
        ..EngineConfig::default()
    };

    match args.transport {
        Transport::Quic => {
            run(
                QuicChannelFactory::new(args.bind.clone()),
                config,
                &args,
                "quic",
            )
            .await;
        }
        Transport::Tcp => {
            run(
                TcpChannelFactory::new(args.bind.clone()),
                config,
                &args,
                "tcp",
            )
            .await;
        }
    }
}

async fn run<F: ChannelFactory>(factory: F, config: EngineConfig, args: &Args, transport: &str) {
    let engine = Engine;
    let handle = engine.start(factory, config);

    spawn_event_printer(handle.events_tx.subscribe());

    let cmd_tx = handle.cmd_tx.clone();

    print_banner(transport, &args.receive_dir);
    print_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        let Some(line) = read_line(&mut stdin).await else {
            // EOF — shut down.
            break;
        };

        if line.is_empty() {
            print_prompt();
            continue;
        }

        let parts: Vec<&str> = line.splitn(3, ' ').collect();

        match parts[0] {
            "offer" => {
                handle_offer_cmd(&cmd_tx).await;
            }
            "take" => {
                handle_take_cmd(&parts, &cmd_tx).await;
            }
            "answer" => {
                handle_answer_cmd(&parts, &cmd_tx).await;
            }
            "send" => {
                handle_send_cmd(&parts, &cmd_tx).await;
            }
            "close" => {
                handle_close_cmd(&parts, &cmd_tx).await;
            }
            "help" | "?" => {
                print_help();
            }
            "quit" | "exit" | "q" => {
                break;
            }
            other => {
                println!("  ❓ Unknown command: \"{other}\".  Type 'help' for usage.");
            }
        }

        print_prompt();
    }

    println!("\n  Shutting down...");
    let _ = cmd_tx.send(EngineCmd::ShutDown).await;
    // Give sessions a moment to clean up.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    println!("  Bye! 👋");
}
