// src/supervisor/console.rs

//! The operator console: a line-delimited text channel with one-line replies.
//!
//! Console connections never touch supervisor state; each command crosses
//! into the main loop as a request with a one-shot reply channel, keeping
//! command execution on the tick like everything else.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// One operator command awaiting execution on the main loop.
#[derive(Debug)]
pub struct ConsoleRequest {
    pub line: String,
    pub reply_tx: oneshot::Sender<String>,
}

/// Accepts console connections until shutdown.
pub async fn run_console_listener(
    listener: TcpListener,
    requests_tx: mpsc::UnboundedSender<ConsoleRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Console service shutting down.");
                break;
            }

            res = listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        debug!("Console connection from {}", addr);
                        let requests_tx = requests_tx.clone();
                        tokio::spawn(async move {
                            run_console_connection(socket, requests_tx).await;
                        });
                    }
                    Err(e) => warn!("Console accept failed: {}", e),
                }
            }
        }
    }
}

async fn run_console_connection(
    socket: tokio::net::TcpStream,
    requests_tx: mpsc::UnboundedSender<ConsoleRequest>,
) {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(1024));

    while let Some(result) = framed.next().await {
        let line = match result {
            Ok(line) => line.trim().to_string(),
            Err(e) => {
                debug!("Console read error: {}", e);
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if requests_tx
            .send(ConsoleRequest {
                line: line.clone(),
                reply_tx,
            })
            .is_err()
        {
            // Main loop is gone; nothing useful to answer.
            break;
        }

        let reply = match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => "supervisor is shutting down".to_string(),
        };
        if framed.send(reply).await.is_err() {
            break;
        }

        // `exit` terminates the supervisor; drop the console session with it.
        if line == "exit" {
            break;
        }
    }
}
