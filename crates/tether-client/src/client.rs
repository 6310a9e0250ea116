use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::identity::load_or_create_identity;
use crate::negotiator::Negotiator;
use crate::transport::{supervise, Command, ConnectionStatus, SequenceGap, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tether_core::frames::{EventFrame, HelloOk};
use tether_storage::{AuthTokenStore, KeyStore};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

const GAP_BUFFER: usize = 64;

/// Public handle to one gateway connection. Cheap to clone; the background
/// supervisor stops when `disconnect` is called or every clone is dropped.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    device_id: String,
    control: Mutex<Option<Control>>,
}

struct Control {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl GatewayClient {
    pub fn new(
        config: ClientConfig,
        key_store: Arc<dyn KeyStore>,
        token_store: Arc<dyn AuthTokenStore>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let identity = load_or_create_identity(key_store.as_ref())?;
        let device_id = identity.device_id().to_string();
        let negotiator = Negotiator::new(config.clone(), identity, token_store);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (hello, _) = watch::channel(None);
        let (events, _) = broadcast::channel(config.event_buffer.max(16));
        let (gaps, _) = broadcast::channel(GAP_BUFFER);
        let shared = Arc::new(Shared {
            config,
            negotiator,
            status,
            hello,
            events,
            gaps,
        });
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                device_id,
                control: Mutex::new(None),
            }),
        })
    }

    /// Uses one store for both the keypair and the token cache.
    pub fn with_store<S>(config: ClientConfig, store: Arc<S>) -> Result<Self, ClientError>
    where
        S: KeyStore + AuthTokenStore + 'static,
    {
        Self::new(config, store.clone(), store)
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.shared.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.shared.status.subscribe()
    }

    /// Event frames in arrival order, including ones that follow a gap.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventFrame> {
        self.inner.shared.events.subscribe()
    }

    pub fn subscribe_gaps(&self) -> broadcast::Receiver<SequenceGap> {
        self.inner.shared.gaps.subscribe()
    }

    /// Hello of the current connection, if connected.
    pub fn hello(&self) -> Option<HelloOk> {
        self.inner.shared.hello.borrow().clone()
    }

    /// Starts the connection supervisor if needed and waits for the next
    /// handshake outcome. A failed attempt is reported here while the
    /// supervisor keeps retrying in the background unless the failure was
    /// a final auth rejection.
    pub async fn connect(&self) -> Result<HelloOk, ClientError> {
        let commands = self.ensure_supervisor().await;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::AwaitHello(reply))
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Closes the socket, rejects every pending call, and stops reconnecting.
    pub async fn disconnect(&self) {
        let control = self.inner.control.lock().await.take();
        let Some(control) = control else {
            return;
        };
        let (reply, rx) = oneshot::channel();
        if control.commands.send(Command::Disconnect(reply)).is_ok() {
            let _ = rx.await;
        }
        let _ = control.task.await;
    }

    pub async fn request_value(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ClientError::NotConnected);
        }
        let commands = {
            let control = self.inner.control.lock().await;
            match control.as_ref() {
                Some(control) => control.commands.clone(),
                None => return Err(ClientError::NotConnected),
            }
        };
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| ClientError::NotConnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|err| ClientError::Protocol(format!("{method} params: {err}")))?;
        let payload = self.request_value(method, params).await?;
        serde_json::from_value(payload)
            .map_err(|err| ClientError::Protocol(format!("{method} response: {err}")))
    }

    async fn ensure_supervisor(&self) -> mpsc::UnboundedSender<Command> {
        let mut control = self.inner.control.lock().await;
        if let Some(existing) = control.as_ref() {
            if !existing.task.is_finished() && !existing.commands.is_closed() {
                return existing.commands.clone();
            }
        }
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(self.inner.shared.clone(), rx));
        *control = Some(Control {
            commands: commands.clone(),
            task,
        });
        commands
    }
}
