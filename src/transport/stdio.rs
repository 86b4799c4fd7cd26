//! stdio 传输：启动子进程，经标准输入输出交换按行分隔的 JSON 记录
//!
//! 子进程环境先清空，只注入少量系统变量与配置中声明的 env（密钥显式传入，不读取全局状态）；
//! stderr 转发到 debug 日志；stdout 读到 EOF 视为传输关闭。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;
use crate::transport::{Transport, TransportKind};

/// 单行最大长度（超出视为帧错误）
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// 从父进程继承的系统变量
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM"];

#[derive(Debug, Clone, Default)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_BYTES)
}

/// 一帧写成一行；帧内不得含换行
async fn write_line<W>(writer: &mut FramedWrite<W, LinesCodec>, frame: Vec<u8>) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let line = String::from_utf8(frame)
        .map_err(|e| TransportError::Framing(format!("frame is not UTF-8: {e}")))?;
    if line.contains('\n') {
        return Err(TransportError::Framing(
            "frame contains an embedded newline".into(),
        ));
    }
    writer.send(line).await.map_err(|e| match e {
        LinesCodecError::Io(io) => TransportError::from(io),
        other => TransportError::Framing(other.to_string()),
    })
}

/// 读下一条非空行；EOF 或 closed 触发时返回 None
async fn read_line<R>(
    reader: &mut FramedRead<R, LinesCodec>,
    closed: &CancellationToken,
) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => return Ok(None),
            next = reader.next() => next,
        };
        match next {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => return Ok(Some(line.into_bytes())),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                return Err(TransportError::Framing(format!(
                    "line exceeds {MAX_LINE_BYTES} bytes"
                )))
            }
            Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            None => return Ok(None),
        }
    }
}

pub struct StdioTransport {
    config: StdioConfig,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<FramedWrite<ChildStdin, LinesCodec>>>,
    stdout: Mutex<Option<FramedRead<ChildStdout, LinesCodec>>>,
    closed: CancellationToken,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.env_clear();
        for key in INHERITED_ENV {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(&self.config.env);
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut child = self.build_command().spawn().map_err(|e| {
            TransportError::Spawn(format!("failed to spawn '{}': {e}", self.config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let command = self.config.command.clone();
            let closed = self.closed.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => tracing::debug!(command = %command, "server stderr: {}", line),
                            _ => break,
                        },
                    }
                }
            });
        }

        tracing::info!(command = %self.config.command, pid = ?child.id(), "stdio server spawned");
        *self.stdin.lock().await = Some(FramedWrite::new(stdin, line_codec()));
        *self.stdout.lock().await = Some(FramedRead::new(stdout, line_codec()));
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or(TransportError::NotOpen)?;
        write_line(writer, frame).await
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut stdout = self.stdout.lock().await;
        let reader = stdout.as_mut().ok_or(TransportError::NotOpen)?;
        // None 即进程退出（stdout EOF）
        read_line(reader, &self.closed).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        // 先关 stdin，给子进程一个正常退出的机会
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}

/// 服务端一侧：在已有的读写管道上按行收发（本进程 stdin / stdout，或测试中的 duplex）
pub struct PipeTransport<R, W> {
    reader: Mutex<FramedRead<R, LinesCodec>>,
    writer: Mutex<FramedWrite<W, LinesCodec>>,
    closed: CancellationToken,
}

impl<R, W> PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(FramedRead::new(reader, line_codec())),
            writer: Mutex::new(FramedWrite::new(writer, line_codec())),
            closed: CancellationToken::new(),
        }
    }
}

/// 本进程的 stdin / stdout
pub fn process_stdio() -> PipeTransport<tokio::io::Stdin, tokio::io::Stdout> {
    PipeTransport::new(tokio::io::stdin(), tokio::io::stdout())
}

#[async_trait]
impl<R, W> Transport for PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        write_line(&mut *self.writer.lock().await, frame).await
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        read_line(&mut *self.reader.lock().await, &self.closed).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stdio_echo_roundtrip_with_cat() {
        let transport = StdioTransport::new(StdioConfig::new("cat"));
        transport.open().await.unwrap();
        transport
            .send(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_vec())
            .await
            .unwrap();
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(frame, br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_vec());
        transport.close().await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_process_exit_is_closure() {
        let transport = StdioTransport::new(StdioConfig::new("true"));
        transport.open().await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_env_map_is_injected() {
        let mut env = BTreeMap::new();
        env.insert("HIVE_SECRET".to_string(), "s3cret".to_string());
        let config = StdioConfig::new("sh")
            .with_args(["-c".to_string(), "echo \"$HIVE_SECRET\"".to_string()])
            .with_env(env);
        let transport = StdioTransport::new(config);
        transport.open().await.unwrap();
        assert_eq!(
            transport.receive().await.unwrap(),
            Some(b"s3cret".to_vec())
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let transport = StdioTransport::new(StdioConfig::new("/definitely/not/a/binary"));
        assert!(matches!(
            transport.open().await,
            Err(TransportError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn test_reject_embedded_newline() {
        let transport = StdioTransport::new(StdioConfig::new("cat"));
        transport.open().await.unwrap();
        assert!(matches!(
            transport.send(b"a\nb".to_vec()).await,
            Err(TransportError::Framing(_))
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_transport_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);
        let server = PipeTransport::new(server_read, server_write);
        let client = PipeTransport::new(client_read, client_write);
        server.open().await.unwrap();
        client.open().await.unwrap();

        client.send(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_vec()).await.unwrap();
        let frame = server.receive().await.unwrap().unwrap();
        assert!(String::from_utf8(frame).unwrap().contains("ping"));

        assert!(matches!(
            server.send(b"a\nb".to_vec()).await,
            Err(TransportError::Framing(_))
        ));

        drop(client);
        assert_eq!(server.receive().await.unwrap(), None);
    }
}
