use testpilot_core::{Config, Conversation, Phase, StreamError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::supervisor::{spawn_reader, SpawnError, Supervisor, WorkerCommand, WorkerEvent, WorkerHandle};

pub const STREAM_CLOSED: &str = "agent stream closed unexpectedly";

pub struct App {
    // Core state
    pub should_quit: bool,
    pub conversation: Conversation,
    pub command: WorkerCommand,
    pub model: String,

    // Credential popup
    pub api_key_input: String,
    pub api_key_input_cursor: usize,

    // Chat input
    pub chat_input: String,
    pub chat_cursor: usize,

    // Transcript viewport, updated while rendering
    pub chat_scroll: u16,
    pub chat_height: u16,
    pub follow_output: bool,

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    // Worker
    worker: Option<WorkerHandle>,
    worker_events: Option<mpsc::Receiver<WorkerEvent>>,
    reader_task: Option<JoinHandle<()>>,

    /// Set when the worker could not be started; ends the session with a
    /// non-zero exit.
    pub startup_error: Option<SpawnError>,
}

impl App {
    pub fn new(command: WorkerCommand, config: &Config) -> Self {
        // Prefill from GEMINI_API_KEY or the saved config.
        let api_key_input = config.api_key.clone().unwrap_or_default();
        let api_key_input_cursor = api_key_input.chars().count();

        Self {
            should_quit: false,
            conversation: Conversation::new(),
            command,
            model: config.model_name().to_string(),

            api_key_input,
            api_key_input_cursor,

            chat_input: String::new(),
            chat_cursor: 0,

            chat_scroll: 0,
            chat_height: 0,
            follow_output: true,

            animation_frame: 0,

            worker: None,
            worker_events: None,
            reader_task: None,

            startup_error: None,
        }
    }

    /// Spawn the worker with the entered credential.
    pub async fn start_worker(&mut self) {
        let api_key = self.api_key_input.trim().to_string();
        if !self.conversation.request_start(&api_key) {
            return;
        }

        match Supervisor::start(&self.command, &api_key).await {
            Ok((handle, reader)) => {
                let (events, task) = spawn_reader(reader);
                self.attach(handle, events, Some(task));
                if let Err(e) = Config::save_api_key(&api_key) {
                    warn!("Failed to remember API key: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to start worker: {}", e);
                self.startup_error = Some(e);
                self.should_quit = true;
            }
        }
    }

    pub fn attach(
        &mut self,
        handle: WorkerHandle,
        events: mpsc::Receiver<WorkerEvent>,
        reader_task: Option<JoinHandle<()>>,
    ) {
        // A retried start replaces the previous worker; dropping its handle kills it.
        if let Some(previous) = self.reader_task.take() {
            previous.abort();
        }
        self.worker = Some(handle);
        self.worker_events = Some(events);
        self.reader_task = reader_task;
    }

    /// Send the chat input unless a request is already in flight.
    pub async fn submit_input(&mut self) {
        let Some(envelope) = self.conversation.submit(&self.chat_input) else {
            return;
        };
        self.chat_input.clear();
        self.chat_cursor = 0;
        self.follow_output = true;

        match self.worker.as_mut() {
            Some(worker) => {
                if let Err(e) = worker.send(&envelope).await {
                    error!("Failed to write to worker: {}", e);
                    self.conversation.fail(&format!("failed to send message: {}", e));
                }
            }
            None => self.conversation.fail("agent is not running"),
        }
    }

    /// Next item from the worker. Pending forever when no worker is attached
    /// or its stream has ended.
    pub async fn next_worker_event(&mut self) -> WorkerEvent {
        match self.worker_events.as_mut() {
            Some(events) => match events.recv().await {
                Some(event) => event,
                None => Err(StreamError::Closed),
            },
            None => std::future::pending().await,
        }
    }

    pub fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            Ok(envelope) => self.conversation.apply(&envelope),
            Err(err) => {
                // The stream is finished either way.
                self.worker_events = None;
                match err {
                    StreamError::Closed => {
                        warn!("Worker output closed");
                        self.conversation.fail(STREAM_CLOSED);
                    }
                    other => {
                        error!("Worker stream failed: {}", other);
                        self.conversation.fail(&other.to_string());
                    }
                }
            }
        }
        self.follow_output = true;
    }

    /// Stop reading and kill the worker.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.worker_events = None;
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown().await;
        }
        info!("Session ended");
    }

    pub fn is_active(&self) -> bool {
        self.conversation.phase() == Phase::Active
    }

    pub fn tick_animation(&mut self) {
        if self.conversation.is_processing() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.follow_output = false;
        self.chat_scroll = self.chat_scroll.saturating_sub(lines);
    }

    /// Rendering clamps the offset and resumes following at the bottom.
    pub fn scroll_down(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_add(lines);
    }

    pub fn half_page(&self) -> u16 {
        (self.chat_height / 2).max(1)
    }

    #[cfg(test)]
    pub(crate) fn detached(config: &Config) -> Self {
        let command = WorkerCommand::resolve(
            Some(std::path::PathBuf::from("testpilot-worker")),
            std::path::PathBuf::from("."),
            None,
        );
        Self::new(command, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testpilot_core::state::Role;
    use testpilot_core::Envelope;
    use tokio::io::AsyncReadExt;

    fn active_app() -> (App, tokio::io::DuplexStream) {
        let mut app = App::detached(&Config::new());
        let (client, server) = tokio::io::duplex(4096);
        let (_tx, rx) = mpsc::channel(4);
        app.attach(WorkerHandle::detached(server), rx, None);
        assert!(app.conversation.request_start("key"));
        app.handle_worker_event(Ok(Envelope::initialized("ready")));
        (app, client)
    }

    async fn written(app: App, mut client: tokio::io::DuplexStream) -> Vec<Envelope> {
        drop(app);
        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        raw.lines().map(|l| Envelope::decode(l).unwrap()).collect()
    }

    #[test]
    fn test_prefills_credential() {
        let mut config = Config::new();
        config.api_key = Some("abc123".to_string());
        let app = App::detached(&config);
        assert_eq!(app.api_key_input, "abc123");
        assert_eq!(app.api_key_input_cursor, 6);
    }

    #[tokio::test]
    async fn test_second_submit_while_processing_writes_nothing() {
        let (mut app, client) = active_app();

        app.chat_input = "write tests for calc.go".to_string();
        app.submit_input().await;
        assert!(app.chat_input.is_empty());

        app.chat_input = "and another".to_string();
        app.submit_input().await;
        assert_eq!(app.chat_input, "and another");

        let sent = written(app, client).await;
        assert_eq!(sent, vec![Envelope::chat("write tests for calc.go")]);
    }

    #[tokio::test]
    async fn test_submit_before_handshake_writes_nothing() {
        let mut app = App::detached(&Config::new());
        let (client, server) = tokio::io::duplex(4096);
        let (_tx, rx) = mpsc::channel(4);
        app.attach(WorkerHandle::detached(server), rx, None);

        app.chat_input = "hello".to_string();
        app.submit_input().await;

        assert!(written(app, client).await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_closure_is_a_system_error() {
        let (mut app, _client) = active_app();
        app.chat_input = "hi".to_string();
        app.submit_input().await;

        app.handle_worker_event(Err(StreamError::Closed));

        let last = app.conversation.entries().last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.is_error);
        assert!(last.content.contains(STREAM_CLOSED));
        assert!(!app.conversation.is_processing());
        assert!(app.worker_events.is_none());
    }

    #[tokio::test]
    async fn test_events_arrive_from_channel() {
        let mut app = App::detached(&Config::new());
        let (tx, rx) = mpsc::channel(4);
        let (_client, server) = tokio::io::duplex(64);
        app.attach(WorkerHandle::detached(server), rx, None);

        tx.send(Ok(Envelope::thinking())).await.unwrap();
        drop(tx);

        assert_eq!(app.next_worker_event().await.unwrap(), Envelope::thinking());
        assert!(matches!(app.next_worker_event().await, Err(StreamError::Closed)));
    }

    #[test]
    fn test_animation_only_while_processing() {
        let mut app = App::detached(&Config::new());
        app.tick_animation();
        assert_eq!(app.animation_frame, 0);
    }
}
