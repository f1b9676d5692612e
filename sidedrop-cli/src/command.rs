use tokio::sync::mpsc;

use sidedrop_engine::engine::{EngineCmd, SessionCmd};

/// Handles the `offer` command.
pub async fn handle_offer_cmd(cmd_tx: &mpsc::Sender<EngineCmd>) {
    if cmd_tx.send(EngineCmd::CreateOffer).await.is_err() {
        println!("  ❌ Engine is gone");
    }
}

/// Handles the `take <code|offer-text>` command.
///
/// Short dash-grouped strings are registry codes; anything longer is
/// treated as pasted offer text.
pub async fn handle_take_cmd(parts: &[&str], cmd_tx: &mpsc::Sender<EngineCmd>) {
    let Some(arg) = parts.get(1) else {
        println!("  Usage: take <code|offer-text>");
        println!("  Example: take 7GK2M-0Q4ZD-RW8XH-2PB5N-9TC3V");
        return;
    };

    let cmd = if looks_like_code(arg) {
        EngineCmd::AcceptCode {
            code: arg.to_string(),
        }
    } else {
        EngineCmd::AcceptOffer {
            encoded: arg.to_string(),
        }
    };

    if cmd_tx.send(cmd).await.is_err() {
        println!("  ❌ Engine is gone");
    }
}

/// Handles the `answer <id> <text>` command.
pub async fn handle_answer_cmd(parts: &[&str], cmd_tx: &mpsc::Sender<EngineCmd>) {
    let (Some(id), Some(text)) = (parts.get(1), parts.get(2)) else {
        println!("  Usage: answer <session-id> <answer-text>");
        return;
    };
    let Ok(session_id) = id.parse::<u64>() else {
        println!("  ❌ \"{id}\" is not a session id");
        return;
    };

    let cmd = EngineCmd::SessionCmd {
        session_id,
        cmd: SessionCmd::AcceptAnswer {
            encoded: text.to_string(),
        },
    };
    if cmd_tx.send(cmd).await.is_err() {
        println!("  ❌ Engine is gone");
    }
}

/// Handles the `send <id> <file>` command.
pub async fn handle_send_cmd(parts: &[&str], cmd_tx: &mpsc::Sender<EngineCmd>) {
    let (Some(id), Some(path)) = (parts.get(1), parts.get(2)) else {
        println!("  Usage: send <session-id> <file-path>");
        println!("  Example: send 1 /home/user/photo.jpg");
        return;
    };
    let Ok(session_id) = id.parse::<u64>() else {
        println!("  ❌ \"{id}\" is not a session id");
        return;
    };

    let path = std::path::PathBuf::from(path);
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) => {
            println!("  ❌ Cannot read file {}: {e}", path.display());
            return;
        }
    };
    if !metadata.is_file() {
        println!("  ❌ {} is not a regular file", path.display());
        return;
    }

    let cmd = EngineCmd::SessionCmd {
        session_id,
        cmd: SessionCmd::SendFile { path },
    };
    if cmd_tx.send(cmd).await.is_err() {
        println!("  ❌ Engine is gone");
    }
}

/// Handles the `close <id>` command.
pub async fn handle_close_cmd(parts: &[&str], cmd_tx: &mpsc::Sender<EngineCmd>) {
    let Some(id) = parts.get(1) else {
        println!("  Usage: close <session-id>");
        return;
    };
    let Ok(session_id) = id.parse::<u64>() else {
        println!("  ❌ \"{id}\" is not a session id");
        return;
    };

    let cmd = EngineCmd::SessionCmd {
        session_id,
        cmd: SessionCmd::Close,
    };
    if cmd_tx.send(cmd).await.is_err() {
        println!("  ❌ Engine is gone");
    }
}

/// Registry codes are five dash-separated groups of five; armored
/// descriptions are one long base64 run.
fn looks_like_code(arg: &str) -> bool {
    arg.len() == 29 && arg.split('-').count() == 5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_dash_grouped_string_expect_code() {
        assert!(looks_like_code("7GK2M-0Q4ZD-RW8XH-2PB5N-9TC3V"));
    }

    #[test]
    fn when_base64_blob_expect_not_code() {
        assert!(!looks_like_code(
            "eyJraW5kIjoib2ZmZXIiLCJ0cmFuc3BvcnQiOiJxdWljIn0="
        ));
        assert!(!looks_like_code("short"));
    }
}
