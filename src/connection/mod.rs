use crate::codec::{FrameDecoder, FrameError};
use crate::config::ConnectionConfig;
use crate::model::{classify, EffectStatus, Inbound, Response};
use crate::queue::RequestQueue;
use crate::sender::{Outbox, ResponseSender};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const READ_CHUNK: usize = 1024;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Explicit shutdown.
    Stopped,
    /// Retries exhausted; the manager is idle until restarted.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not connect after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("connection i/o: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    PeerClosed,
    WriterGone,
}

/// Owns the controller socket: connect with timeout, bounded retry, the
/// receive loop and keep-alives. Decoded commands land in the request queue;
/// all writes go through the shared [`ResponseSender`].
pub struct ConnectionManager {
    config: ConnectionConfig,
    queue: RequestQueue,
    sender: ResponseSender,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, queue: RequestQueue, sender: ResponseSender) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            queue,
            sender,
            state_tx,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Ask the supervisor to close the socket and exit. Safe to call repeatedly.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Connection supervisor. Returns `Ok` after `stop`, or
    /// `RetriesExhausted` once `max_attempts` consecutive connects fail.
    pub async fn run(&self) -> Result<(), ConnectionError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let endpoint = self.config.endpoint();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            tracing::info!(endpoint = %endpoint, attempt = failures + 1, "connecting to controller");

            let attempt = tokio::select! {
                _ = shutdown.changed() => continue,
                res = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(&endpoint)) => res,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    failures = 0;
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(error = %err, "set_nodelay failed");
                    }
                    let session_id = Uuid::new_v4();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(endpoint = %endpoint, session_id = %session_id, "controller connected");

                    match self.run_session(stream, &mut shutdown, session_id).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(end) => {
                            tracing::info!(session_id = %session_id, reason = ?end, "controller connection lost")
                        }
                        Err(err) => {
                            tracing::warn!(session_id = %session_id, error = %err, "controller connection lost")
                        }
                    }
                    self.set_state(ConnectionState::Disconnected);
                }
                Ok(Err(err)) => {
                    failures += 1;
                    tracing::warn!(endpoint = %endpoint, attempt = failures, error = %err, "connect failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempt = failures,
                        timeout_ms = self.config.connect_timeout_ms,
                        "connect timed out"
                    );
                }
            }

            if failures >= self.config.max_attempts {
                self.set_state(ConnectionState::Failed);
                tracing::error!(
                    endpoint = %endpoint,
                    attempts = failures,
                    "could not connect to controller; giving up"
                );
                return Err(ConnectionError::RetriesExhausted { attempts: failures });
            }

            self.set_state(ConnectionState::Disconnected);
            if !wait_unless_stopped(&mut shutdown, self.config.retry_delay()).await {
                break;
            }
        }

        self.set_state(ConnectionState::Stopped);
        tracing::info!("controller connection stopped");
        Ok(())
    }

    async fn run_session<T>(
        &self,
        stream: T,
        shutdown: &mut watch::Receiver<bool>,
        session_id: Uuid,
    ) -> Result<SessionEnd, ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let mut writer_task = tokio::spawn(write_outbox(writer, self.sender.attach()));
        let keepalive_task = self.spawn_keepalive(session_id);
        let mut writer_done = false;

        let result = self
            .read_loop(&mut reader, &mut writer_task, &mut writer_done, shutdown, session_id)
            .await;

        keepalive_task.abort();
        self.sender.detach();
        // A completed JoinHandle must not be polled again.
        if !writer_done {
            // Dropping the outbox sender lets the writer flush what is queued and exit.
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
                .await
                .is_err()
            {
                writer_task.abort();
            }
        }
        result
    }

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        writer_task: &mut JoinHandle<io::Result<()>>,
        writer_done: &mut bool,
        shutdown: &mut watch::Receiver<bool>,
        session_id: Uuid,
    ) -> Result<SessionEnd, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new(self.config.max_frame_bytes);
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
                res = &mut *writer_task => {
                    *writer_done = true;
                    return match res {
                        Ok(Ok(())) => Ok(SessionEnd::WriterGone),
                        Ok(Err(err)) => Err(err.into()),
                        Err(err) => Err(io::Error::other(err).into()),
                    };
                }
                res = tokio::time::timeout(self.config.poll_interval(), reader.read(&mut buf)) => res,
            };

            let n = match read {
                Err(_) => {
                    tracing::trace!(session_id = %session_id, "receive idle; sending keep-alive");
                    if self.sender.keep_alive().is_err() {
                        return Ok(SessionEnd::WriterGone);
                    }
                    continue;
                }
                Ok(Ok(0)) => return Ok(SessionEnd::PeerClosed),
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
            };

            for decoded in decoder.feed(&buf[..n]) {
                match decoded {
                    Ok(frame) => self.handle_frame(&frame, session_id),
                    Err(FrameError::TooLarge(size)) => {
                        tracing::warn!(session_id = %session_id, size, "discarding oversized frame");
                    }
                    Err(err) => {
                        tracing::warn!(session_id = %session_id, error = %err, "frame decode failed");
                    }
                }
            }
        }
    }

    fn handle_frame(&self, frame: &[u8], session_id: Uuid) {
        match classify(frame) {
            Ok(Inbound::KeepAlive) => {
                tracing::trace!(session_id = %session_id, "keep-alive received");
            }
            Ok(Inbound::Command(request)) => {
                tracing::debug!(
                    session_id = %session_id,
                    request_id = %request.id,
                    code = %request.code,
                    "command queued"
                );
                self.queue.push(request);
            }
            Err(err) => match err.request_id() {
                Some(id) => {
                    tracing::warn!(session_id = %session_id, request_id = %id, error = %err, "rejecting command");
                    let response =
                        Response::new(id.clone(), EffectStatus::Failure).with_message(err.to_string());
                    if let Err(send_err) = self.sender.send(&response) {
                        tracing::debug!(error = %send_err, "protocol failure not sent");
                    }
                }
                None => {
                    tracing::warn!(session_id = %session_id, error = %err, "dropping unreadable frame");
                }
            },
        }
    }

    fn spawn_keepalive(&self, session_id: Uuid) -> JoinHandle<()> {
        let sender = self.sender.clone();
        let period = self.config.keepalive_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(err) = sender.keep_alive() {
                    tracing::debug!(session_id = %session_id, error = %err, "keep-alive task exiting");
                    break;
                }
            }
        })
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }
}

async fn write_outbox<W>(mut writer: W, mut outbox: Outbox) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbox.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Sleep for `delay`; `false` when shutdown was requested first.
async fn wait_unless_stopped(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = shutdown.changed() => !*shutdown.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestId;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout_ms: 500,
            retry_delay_ms: 20,
            max_attempts: 3,
            poll_interval_ms: 60,
            keepalive_interval_ms: 10_000,
            max_frame_bytes: 256,
        }
    }

    async fn read_json(client: &mut DuplexStream) -> serde_json::Value {
        let mut frame = Vec::new();
        loop {
            let byte = client.read_u8().await.unwrap();
            if byte == 0 {
                break;
            }
            frame.push(byte);
        }
        serde_json::from_slice(&frame).unwrap()
    }

    async fn wait_for_queue(queue: &RequestQueue, len: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn spawn_session(
        config: ConnectionConfig,
    ) -> (
        DuplexStream,
        Arc<ConnectionManager>,
        JoinHandle<Result<SessionEnd, ConnectionError>>,
    ) {
        let (server_side, client_side) = tokio::io::duplex(16 * 1024);
        let manager = Arc::new(ConnectionManager::new(
            config,
            RequestQueue::new(),
            ResponseSender::new(),
        ));
        let task_manager = manager.clone();
        let task = tokio::spawn(async move {
            let mut shutdown = task_manager.shutdown_tx.subscribe();
            task_manager
                .run_session(server_side, &mut shutdown, Uuid::new_v4())
                .await
        });
        (client_side, manager, task)
    }

    #[tokio::test]
    async fn commands_split_across_reads_are_queued_in_order() {
        let (mut client, manager, _task) = spawn_session(test_config(1));
        client
            .write_all(b"{\"id\":1,\"code\":\"heal_10\"}\0{\"id\":2,\"co")
            .await
            .unwrap();
        client.write_all(b"de\":\"hurt_10\"}\0{}\0").await.unwrap();

        wait_for_queue(&manager.queue, 2).await;
        let first = manager.queue.pop().unwrap();
        let second = manager.queue.pop().unwrap();
        assert_eq!(first.id, RequestId::Number(1));
        assert_eq!(second.code, "hurt_10");
        assert!(manager.queue.pop().is_none());
    }

    #[tokio::test]
    async fn idle_receive_sends_keep_alive() {
        let (mut client, _manager, _task) = spawn_session(test_config(1));
        let msg = tokio::time::timeout(Duration::from_millis(500), read_json(&mut client))
            .await
            .unwrap();
        assert_eq!(msg, serde_json::json!({"status": "KeepAlive"}));
    }

    #[tokio::test]
    async fn periodic_keep_alive_runs_regardless_of_traffic() {
        let mut config = test_config(1);
        config.poll_interval_ms = 10_000;
        config.keepalive_interval_ms = 30;
        let (mut client, _manager, _task) = spawn_session(config);
        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_millis(500), read_json(&mut client))
                .await
                .unwrap();
            assert_eq!(msg["status"], "KeepAlive");
        }
    }

    #[tokio::test]
    async fn invalid_command_with_id_gets_failure() {
        let mut config = test_config(1);
        config.poll_interval_ms = 10_000;
        let (mut client, manager, _task) = spawn_session(config);
        client
            .write_all(b"{\"id\":7,\"code\":42}\0not json\0")
            .await
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_millis(500), read_json(&mut client))
            .await
            .unwrap();
        assert_eq!(msg["requestId"], 7);
        assert_eq!(msg["status"], "Failure");
        assert!(manager.queue.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_dropped_and_session_continues() {
        let mut config = test_config(1);
        config.poll_interval_ms = 10_000;
        let (mut client, manager, _task) = spawn_session(config);
        client.write_all(&[b'x'; 300]).await.unwrap();
        client.write_all(b"\0").await.unwrap();
        client
            .write_all(b"{\"id\":3,\"code\":\"tire_10\"}\0")
            .await
            .unwrap();
        wait_for_queue(&manager.queue, 1).await;
        assert_eq!(manager.queue.pop().unwrap().code, "tire_10");
    }

    #[tokio::test]
    async fn peer_close_ends_session() {
        let (client, manager, task) = spawn_session(test_config(1));
        drop(client);
        let end = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            end,
            Ok(SessionEnd::PeerClosed) | Ok(SessionEnd::WriterGone) | Err(_)
        ));
        assert!(!manager.sender.is_attached());
    }

    #[tokio::test]
    async fn stop_ends_session_promptly() {
        let (_client, manager, task) = spawn_session(test_config(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.stop();
        let end = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, Ok(SessionEnd::Shutdown)));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = ConnectionManager::new(test_config(port), RequestQueue::new(), ResponseSender::new());
        let result = tokio::time::timeout(Duration::from_secs(5), manager.run())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::RetriesExhausted { attempts: 3 })
        ));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn run_delivers_commands_and_responses_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = Arc::new(ConnectionManager::new(
            test_config(port),
            RequestQueue::new(),
            ResponseSender::new(),
        ));
        let mut states = manager.subscribe();
        let run_manager = manager.clone();
        let run = tokio::spawn(async move { run_manager.run().await });

        let (mut controller, _) = listener.accept().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        controller
            .write_all(b"{\"id\":11,\"code\":\"give_money_100\"}\0")
            .await
            .unwrap();
        wait_for_queue(&manager.queue, 1).await;
        let request = manager.queue.pop().unwrap();
        manager
            .sender
            .respond(&request, EffectStatus::Success, "")
            .unwrap();

        let mut frame = Vec::new();
        loop {
            let byte = controller.read_u8().await.unwrap();
            if byte == 0 {
                let msg: serde_json::Value = serde_json::from_slice(&frame).unwrap();
                if msg["status"] == "KeepAlive" {
                    frame.clear();
                    continue;
                }
                assert_eq!(msg, serde_json::json!({"requestId": 11, "status": "Success"}));
                break;
            }
            frame.push(byte);
        }

        manager.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(manager.state(), ConnectionState::Stopped);
    }

    /// Reads pass through; every write fails as if the peer reset the socket.
    struct BrokenWrites(DuplexStream);

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_socket_write_ends_session_without_panicking() {
        let mut config = test_config(1);
        config.poll_interval_ms = 20;
        let (server_side, _client_side) = tokio::io::duplex(1024);
        let manager = Arc::new(ConnectionManager::new(
            config,
            RequestQueue::new(),
            ResponseSender::new(),
        ));
        let task_manager = manager.clone();
        let task = tokio::spawn(async move {
            let mut shutdown = task_manager.shutdown_tx.subscribe();
            task_manager
                .run_session(BrokenWrites(server_side), &mut shutdown, Uuid::new_v4())
                .await
        });

        let end = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .expect("session task must not panic");
        assert!(matches!(
            end,
            Err(ConnectionError::Io(_)) | Ok(SessionEnd::WriterGone)
        ));
        assert!(!manager.sender.is_attached());
    }

    #[tokio::test]
    async fn reconnects_after_peer_drops_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = test_config(port);
        config.retry_delay_ms = 200;
        let manager = Arc::new(ConnectionManager::new(
            config,
            RequestQueue::new(),
            ResponseSender::new(),
        ));
        let mut states = manager.subscribe();
        let run_manager = manager.clone();
        let run = tokio::spawn(async move { run_manager.run().await });

        let (first, _) = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s != ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        let (mut second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        second
            .write_all(b"{\"id\":21,\"code\":\"heal_10\"}\0")
            .await
            .unwrap();
        wait_for_queue(&manager.queue, 1).await;
        assert_eq!(manager.queue.pop().unwrap().id, RequestId::Number(21));

        manager.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(manager.state(), ConnectionState::Stopped);
    }
}
