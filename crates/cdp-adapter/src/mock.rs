//! Scripted in-process transport used by tests across the workspace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{AdapterError, AdapterErrorKind};
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

type Responder = Arc<dyn Fn(&Value) -> Result<Value, AdapterError> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RecordedCommand {
    pub target: CommandTarget,
    pub method: String,
    pub params: Value,
}

pub struct ScriptedTransport {
    commands: Mutex<Vec<RecordedCommand>>,
    responders: Mutex<HashMap<String, Responder>>,
    start_error: Mutex<Option<AdapterError>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<TransportEvent>>,
    closed: AtomicBool,
    shutdowns: AtomicUsize,
}

impl ScriptedTransport {
    /// Target bootstrap answers with `T-1` / `S-1`; every other method answers `{}`.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            commands: Mutex::new(Vec::new()),
            responders: Mutex::new(HashMap::new()),
            start_error: Mutex::new(None),
            events_tx: Mutex::new(Some(tx)),
            events_rx: AsyncMutex::new(rx),
            closed: AtomicBool::new(false),
            shutdowns: AtomicUsize::new(0),
        };
        transport.respond("Target.createTarget", json!({ "targetId": "T-1" }));
        transport.respond("Target.attachToTarget", json!({ "sessionId": "S-1" }));
        Arc::new(transport)
    }

    pub fn respond(&self, method: &str, value: Value) {
        self.respond_with(method, move |_| Ok(value.clone()));
    }

    pub fn respond_with<F>(&self, method: &str, responder: F)
    where
        F: Fn(&Value) -> Result<Value, AdapterError> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .insert(method.to_string(), Arc::new(responder));
    }

    pub fn fail(&self, method: &str, err: AdapterError) {
        self.respond_with(method, move |_| Err(err.clone()));
    }

    pub fn fail_start(&self, err: AdapterError) {
        *self.start_error.lock() = Some(err);
    }

    pub fn emit(&self, method: &str, params: Value, session_id: Option<&str>) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(TransportEvent {
                method: method.to_string(),
                params,
                session_id: session_id.map(str::to_string),
            });
        }
    }

    /// End the event stream as if the browser went away.
    pub fn disconnect(&self) {
        self.events_tx.lock().take();
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().clone()
    }

    /// Params of every recorded call to `method`, oldest first.
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.commands
            .lock()
            .iter()
            .filter(|cmd| cmd.method == method)
            .map(|cmd| cmd.params.clone())
            .collect()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CdpTransport for ScriptedTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        match self.start_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint("transport closed"));
        }
        self.commands.lock().push(RecordedCommand {
            target,
            method: method.to_string(),
            params: params.clone(),
        });
        let responder = self.responders.lock().get(method).cloned();
        match responder {
            Some(responder) => responder(&params),
            None => Ok(json!({})),
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.disconnect();
    }
}
