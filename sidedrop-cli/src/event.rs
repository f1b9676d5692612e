use tokio::sync::broadcast;

use sidedrop_engine::engine::{EngineEvent, SessionEvent};

use crate::ui::{format_size, print_prompt};

/// Spawns a task that listens for engine events and prints them.
pub fn spawn_event_printer(mut events_rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(EngineEvent::SessionCreated { session_id, role }) => {
                    println!("\n  📡 Session #{session_id} created ({role:?})");
                    print_prompt();
                }
                Ok(EngineEvent::SessionEvent { session_id, event }) => {
                    handle_session_event(session_id, &event);
                }
                Ok(EngineEvent::Error { message }) => {
                    println!("\n  ❌ {message}");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn handle_session_event(session_id: u64, event: &SessionEvent) {
    match event {
        SessionEvent::OfferReady { code, encoded } => {
            println!();
            println!("  📨 Session #{session_id}: offer ready.");
            println!("     Code (same process):  {code}");
            println!("     Offer text (anywhere):");
            println!("     {encoded}");
            println!("     Once you have the answer, run: answer {session_id} <text>");
        }
        SessionEvent::AnswerReady { encoded } => {
            println!();
            println!("  📨 Session #{session_id}: answer ready — send this back:");
            println!("     {encoded}");
            println!("     Now waiting for the sender to connect...");
        }
        SessionEvent::Connected { peer } => {
            println!("\n  🤝 Session #{session_id}: connected to {peer}");
        }
        SessionEvent::TransferComplete { bytes_sent } => {
            println!(
                "\n  ✅ Session #{session_id}: sent {size}",
                size = format_size(*bytes_sent)
            );
        }
        SessionEvent::TransferReceived {
            file_name,
            size_bytes,
            stored_path,
        } => {
            println!(
                "\n  ✅ Session #{session_id}: received \"{file_name}\" ({size})",
                size = format_size(*size_bytes)
            );
            println!("     Saved to {}", stored_path.display());
        }
        SessionEvent::Error { message } => {
            println!("\n  ❌ Session #{session_id}: {message}");
        }
        SessionEvent::Failed { reason } => {
            println!("\n  💥 Session #{session_id} failed: {reason}");
        }
        SessionEvent::Closed => {
            println!("\n  ⏹ Session #{session_id} closed");
        }
        SessionEvent::Finished => return,
    }
    print_prompt();
}
