//! Newline-delimited JSON over stdio.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::ipc::{parse_control, ControlMessage, ControlResponse};

/// Read control messages line by line until EOF.
///
/// Lines that are not UTF-8 or fail to parse are answered with an `error`
/// response on `outbound` and otherwise skipped. Returning drops `control`,
/// which the host treats as a disconnect.
pub async fn read_control<R>(
    mut reader: R,
    control: mpsc::UnboundedSender<ControlMessage>,
    outbound: mpsc::UnboundedSender<ControlResponse>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                log::warn!("rejected non-UTF-8 control line: {e}");
                let _ = outbound.send(ControlResponse::error(
                    "",
                    format!("invalid control message: {e}"),
                ));
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        match parse_control(line) {
            Ok(message) => {
                log::trace!("control message for {}", message.id());
                if control.send(message).is_err() {
                    break;
                }
            }
            Err(response) => {
                log::warn!("rejected control line: {line}");
                let _ = outbound.send(response);
            }
        }
    }
    log::debug!("control input reached EOF");
    Ok(())
}

/// Write every response as one JSON line until all senders are gone.
pub async fn write_responses<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<ControlResponse>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
