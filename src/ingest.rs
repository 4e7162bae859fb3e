//! Decoded-message intake.
//!
//! The upstream decoder delivers one JSON-encoded [`DecodedMessage`] per
//! line over a plain TCP connection. Malformed lines are logged and
//! skipped so one bad event never stalls the feed.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::models::DecodedMessage;
use crate::pipeline::Pipeline;

pub struct IngestServer {
    pipeline: Arc<Pipeline>,
}

impl IngestServer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "Decoder connected");
                    let server = self.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stream).lines();
                        loop {
                            match lines.next_line().await {
                                Ok(Some(line)) => server.handle_line(&line).await,
                                Ok(None) => break,
                                Err(e) => {
                                    debug!(%peer, "Decoder read error: {e}");
                                    break;
                                }
                            }
                        }
                        info!(%peer, "Decoder disconnected");
                    });
                }
                Err(e) => error!("Accept failed: {e}"),
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<DecodedMessage>(line) {
            Ok(msg) => self.pipeline.accept(msg).await,
            Err(e) => warn!("Skipping undecodable message event: {e}"),
        }
    }
}
