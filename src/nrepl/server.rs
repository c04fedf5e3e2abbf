use super::bencode::{Bencode, FrameDecoder};
use super::ops::{dispatch, OpContext, SessionTable};
use crate::backend::Backend;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 8 * 1024;

/// Port discovery file, removed again when dropped.
#[derive(Debug)]
pub struct PortFile {
    path: PathBuf,
}

impl PortFile {
    pub fn create(path: impl Into<PathBuf>, port: u16) -> std::io::Result<Self> {
        let path = path.into();
        std::fs::write(&path, port.to_string())?;
        debug!("Wrote nREPL port {} to {}", port, path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PortFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// bencode-over-TCP server speaking the nREPL op set.
pub struct NreplServer {
    listener: TcpListener,
    context: Arc<OpContext>,
    port_file: Option<PortFile>,
}

impl NreplServer {
    /// Bind the listener and, when `port_file` is given, advertise the bound
    /// port there until the server is dropped.
    pub async fn bind(
        addr: &str,
        backend: Arc<dyn Backend>,
        language: impl Into<String>,
        port_file: Option<PathBuf>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind nREPL server to {}", addr))?;
        let port = listener.local_addr()?.port();

        let port_file = match port_file {
            Some(path) => Some(
                PortFile::create(&path, port)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
            ),
            None => None,
        };

        Ok(Self {
            listener,
            context: Arc::new(OpContext {
                backend,
                sessions: Arc::new(SessionTable::new()),
                language: language.into(),
            }),
            port_file,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn port_file(&self) -> Option<&Path> {
        self.port_file.as_ref().map(PortFile::path)
    }

    /// Accept connections until `shutdown` resolves. The port file is removed
    /// on return.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let NreplServer {
            listener,
            context,
            port_file,
        } = self;
        tokio::pin!(shutdown);

        info!("nREPL server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("nREPL server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection(stream, peer, &context),
                    Err(e) => warn!("Failed to accept nREPL connection: {}", e),
                },
            }
        }

        drop(port_file);
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl-C handler: {}", e);
            }
        })
        .await
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, context: &Arc<OpContext>) {
    let context = Arc::clone(context);
    tokio::spawn(async move {
        debug!("nREPL client connected from {}", peer);
        match handle_connection(stream, context).await {
            Ok(()) => debug!("nREPL client {} disconnected", peer),
            Err(e) => warn!("nREPL connection from {} closed: {}", peer, e),
        }
    });
}

async fn handle_connection(stream: TcpStream, context: Arc<OpContext>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bencode>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            writer.write_all(&message.encode()).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    if let Err(e) = read_requests(reader, &context, &tx).await {
        writer_task.abort();
        return Err(e);
    }

    // Let in-flight ops finish writing before the socket is dropped.
    drop(tx);
    match writer_task.await {
        Ok(result) => result.context("Failed to write nREPL reply"),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read_requests(
    mut reader: OwnedReadHalf,
    context: &Arc<OpContext>,
    sink: &mpsc::UnboundedSender<Bencode>,
) -> Result<()> {
    let mut frames = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        frames.extend(&chunk[..n]);

        while let Some(request) = frames.next_message()? {
            // Ops on one connection run concurrently, in no fixed order.
            let context = context.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                dispatch(&context, request, sink).await;
            });
        }
    }
}
