//! TCP text bridge between the gateway and a controller.
//!
//! One controller is served at a time. Each line it writes is handed to the
//! engine; each message the gateway delivers comes back as one line. Lines
//! produced while no controller is connected are dropped.

use crate::{component_debug, component_info, component_warn};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Serve controllers on `listener` until `shutdown` flips to true
pub async fn serve(
    listener: TcpListener,
    to_engine: mpsc::UnboundedSender<String>,
    mut from_engine: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    component_info!("bridge", "Listening for controller on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                component_info!("bridge", "Controller connected from {}", peer);
                let stop = serve_client(stream, &to_engine, &mut from_engine, &mut shutdown).await;
                component_info!("bridge", "Controller {} disconnected", peer);
                if stop {
                    return Ok(());
                }
            }
            line = from_engine.recv() => {
                match line {
                    Some(line) => component_debug!("bridge", "No controller, dropping {}", line.trim_end()),
                    None => return Ok(()),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Returns true when the bridge should stop altogether
async fn serve_client(
    stream: TcpStream,
    to_engine: &mpsc::UnboundedSender<String>,
    from_engine: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if to_engine.send(line).is_err() {
                            return true;
                        }
                    }
                    Ok(None) => return false,
                    Err(e) => {
                        component_warn!("bridge", "Read from controller failed: {}", e);
                        return false;
                    }
                }
            }
            out = from_engine.recv() => {
                let Some(out) = out else {
                    return true;
                };
                if let Err(e) = writer.write_all(out.as_bytes()).await {
                    component_warn!("bridge", "Write to controller failed: {}", e);
                    return false;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start() -> (
        std::net::SocketAddr,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (to_engine, engine_rx) = mpsc::unbounded_channel();
        let (engine_tx, from_engine) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(serve(listener, to_engine, from_engine, shutdown_rx));
        (addr, engine_rx, engine_tx, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_lines_flow_both_ways() {
        let (addr, mut engine_rx, engine_tx, shutdown_tx, handle) = start().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"5;1;1;2;0;hello\n\n").await.unwrap();

        let got = timeout(Duration::from_secs(5), engine_rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("5;1;1;2;0;hello"));

        engine_tx.send("5;1;1;2;2;21\n".to_string()).unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = timeout(Duration::from_secs(5), lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line.as_deref(), Some("5;1;1;2;2;21"));

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (addr, mut engine_rx, _engine_tx, shutdown_tx, handle) = start().await;

        let first = TcpStream::connect(addr).await.unwrap();
        drop(first);

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"0;0;3;2;0;\n").await.unwrap();
        let got = timeout(Duration::from_secs(5), engine_rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("0;0;3;2;0;"));

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }
}
