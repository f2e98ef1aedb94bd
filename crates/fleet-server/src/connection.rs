use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error};

use fleet_protocol::{ErrorCode, Request, Response};

use crate::dispatch::Dispatcher;

/// Handle a single peer connection: newline-delimited JSON requests in,
/// one JSON response per line out. The peer's source IP keys management
/// sessions.
pub async fn handle_client(stream: TcpStream, dispatcher: Arc<Dispatcher>, peer_ip: String) {
    let (reader, mut writer) = stream.into_split();
    let reader = BufReader::new(reader);
    let mut lines = reader.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(peer_ip, "client disconnected");
                break;
            }
            Err(e) => {
                error!(peer_ip, "read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatcher.handle(request, &peer_ip).await,
            Err(e) => Response::Error {
                message: format!("invalid request: {e}"),
                code: ErrorCode::InvalidRequest,
            },
        };

        if let Err(e) = write_response(&mut writer, &response).await {
            error!(peer_ip, "write error: {e}");
            break;
        }
    }
}

async fn write_response(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    response: &Response,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}
