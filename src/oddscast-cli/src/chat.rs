//! Line-based chat transport.
//!
//! Each connection sends lines of the form `<voter-id> <message>`. Votes go
//! to the show's vote handle; the operator can also `!pause` and `!resume`.

use std::sync::Arc;

use oddscast_core::{ShowControl, VoteHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A parsed chat line.
#[derive(Debug, PartialEq, Eq)]
pub struct ChatLine<'a> {
    pub voter_id: &'a str,
    pub message: &'a str,
}

pub fn parse_line(line: &str) -> Option<ChatLine<'_>> {
    let (voter_id, message) = line.trim().split_once(char::is_whitespace)?;
    let message = message.trim();
    if voter_id.is_empty() || message.is_empty() {
        return None;
    }
    Some(ChatLine { voter_id, message })
}

/// Operator commands understood on the chat line.
pub fn operator_command(message: &str) -> Option<ShowControl> {
    match message.trim().to_lowercase().as_str() {
        "!pause" => Some(ShowControl::Paused),
        "!resume" => Some(ShowControl::Running),
        _ => None,
    }
}

#[derive(Clone)]
pub struct ChatRouter {
    votes: VoteHandle,
    control: Arc<watch::Sender<ShowControl>>,
    operator: Option<String>,
}

impl ChatRouter {
    pub fn new(
        votes: VoteHandle,
        control: Arc<watch::Sender<ShowControl>>,
        operator: Option<String>,
    ) -> Self {
        Self {
            votes,
            control,
            operator,
        }
    }

    /// Route one line. Returns whether it had any effect.
    pub fn handle_line(&self, line: &str) -> bool {
        let Some(chat) = parse_line(line) else {
            return false;
        };

        if self.operator.as_deref() == Some(chat.voter_id) {
            if let Some(command) = operator_command(chat.message) {
                return self.apply(command);
            }
        }

        let counted = self.votes.cast_chat(chat.voter_id, chat.message);
        if counted {
            debug!("Vote from {}: {}", chat.voter_id, chat.message);
        }
        counted
    }

    fn apply(&self, command: ShowControl) -> bool {
        // Never undo a shutdown from chat.
        let changed = self.control.send_if_modified(|current| {
            if *current == ShowControl::Shutdown || *current == command {
                return false;
            }
            *current = command;
            true
        });
        if changed {
            info!("Operator set show to {:?}", command);
        }
        changed
    }
}

/// Accept chat connections on `addr` forever.
pub async fn serve(addr: String, router: ChatRouter) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Chat listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("Chat client connected: {}", peer);
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &router).await {
                warn!("Chat client {} dropped: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, router: &ChatRouter) -> std::io::Result<()> {
    let mut lines = BufReader::new(socket).lines();
    while let Some(line) = lines.next_line().await? {
        router.handle_line(&line);
    }
    Ok(())
}
