//! In-memory stand-ins for the executor and the transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::shell::{CommandExecutor, ExecError, ExecFailure, OutputStream, StreamingProcess};
use crate::transport::{ServerMessage, Transport, TransportError};

/// Output a mocked streaming process produces.
#[derive(Clone, Default)]
pub struct StreamScript {
    pub stdout: String,
    pub stderr: String,
    /// Keep both streams open until the process is cancelled.
    pub hold_open: bool,
    /// Wait this long before writing anything.
    pub delay: Duration,
}

impl StreamScript {
    pub fn open(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            hold_open: true,
            ..Self::default()
        }
    }

    pub fn closed(stdout: &str, stderr: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            hold_open: false,
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type RunHandler = Box<dyn Fn(&str) -> Result<String, ExecFailure> + Send + Sync>;
type StreamHandler = Box<dyn Fn(&str) -> Result<StreamScript, ExecError> + Send + Sync>;

pub struct MockExecutor {
    commands: Mutex<Vec<String>>,
    tokens: Mutex<Vec<CancellationToken>>,
    on_run: RunHandler,
    on_stream: StreamHandler,
    run_delay: Duration,
}

impl MockExecutor {
    /// Every one-shot command succeeds silently, every streaming command
    /// reports a ready tunnel and stays open.
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            on_run: Box::new(|_| Ok(String::new())),
            on_stream: Box::new(|_| Ok(StreamScript::open("Listening on port [5555].\n"))),
            run_delay: Duration::ZERO,
        }
    }

    pub fn on_run(
        mut self,
        handler: impl Fn(&str) -> Result<String, ExecFailure> + Send + Sync + 'static,
    ) -> Self {
        self.on_run = Box::new(handler);
        self
    }

    pub fn on_stream(
        mut self,
        handler: impl Fn(&str) -> Result<StreamScript, ExecError> + Send + Sync + 'static,
    ) -> Self {
        self.on_stream = Box::new(handler);
        self
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().unwrap().clone()
    }

    fn record(&self, command: &str) {
        self.commands.lock().unwrap().push(command.to_string());
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn scripted_stream(
    data: String,
    cancel: CancellationToken,
    hold_open: bool,
    delay: Duration,
) -> OutputStream {
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = writer.write_all(data.as_bytes()).await;
        if hold_open {
            cancel.cancelled().await;
        }
        drop(writer);
    });
    Box::new(reader)
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(&self, command: &str) -> Result<String, ExecFailure> {
        self.record(command);
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        (self.on_run)(command)
    }

    async fn run_with_deadline(
        &self,
        command: &str,
        deadline: Duration,
    ) -> Result<String, ExecFailure> {
        match tokio::time::timeout(deadline, self.run(command)).await {
            Ok(result) => result,
            Err(_) => Err(ExecFailure::new(ExecError::Timeout)),
        }
    }

    async fn run_streaming(&self, command: &str) -> Result<StreamingProcess, ExecError> {
        self.record(command);
        let script = (self.on_stream)(command)?;
        let cancel = CancellationToken::new();
        self.tokens.lock().unwrap().push(cancel.clone());
        Ok(StreamingProcess {
            stdout: scripted_stream(script.stdout, cancel.clone(), script.hold_open, script.delay),
            stderr: scripted_stream(script.stderr, cancel.clone(), script.hold_open, script.delay),
            cancel,
        })
    }
}

pub struct MockTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    sent: Mutex<Vec<ServerMessage>>,
    closes: AtomicUsize,
}

impl MockTransport {
    /// The returned sender plays the client. Dropping it closes the connection.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        (transport, tx)
    }

    pub fn sent(&self) -> Vec<ServerMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent().into_iter().filter_map(|m| m.message).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.sent().into_iter().filter_map(|m| m.error).collect()
    }

    pub fn count_messages(&self, needle: &str) -> usize {
        self.messages().iter().filter(|m| m.contains(needle)).count()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn recv(&self) -> Result<String, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        if self.close_count() > 0 {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
