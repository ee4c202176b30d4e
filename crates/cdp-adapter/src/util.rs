use anyhow::{anyhow, Result};
use chromiumoxide::async_process::Child;
use futures::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures::stream::StreamExt;
use tokio::time::{timeout, Duration};

const WS_URL_WAIT: Duration = Duration::from_secs(20);

/// Extract DevTools websocket URL from Chromium stderr output.
pub async fn extract_ws_url(child: &mut Child) -> Result<String> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("chromium process missing stderr handle"))?;
    read_ws_url(stderr, WS_URL_WAIT).await
}

pub(crate) async fn read_ws_url<R>(stream: R, wait: Duration) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut captured = Vec::new();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line?;
            if let Some(ws) = parse_listening_line(&line) {
                return Ok(ws.to_string());
            }
            captured.push(line);
        }
        Err(anyhow!(
            "chromium exited before exposing devtools websocket url. stderr preview: {}",
            captured
                .iter()
                .take(8)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | ")
        ))
    };

    timeout(wait, reader)
        .await
        .map_err(|_| anyhow!("timed out waiting for chromium devtools websocket url"))?
}

/// `DevTools listening on ws://127.0.0.1:9222/devtools/browser/<id>`
fn parse_listening_line(line: &str) -> Option<&str> {
    let (_, ws) = line.rsplit_once("listening on ")?;
    let ws = ws.trim();
    (ws.starts_with("ws") && ws.contains("devtools/browser")).then_some(ws)
}
