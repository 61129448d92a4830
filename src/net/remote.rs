//! Remote Invocation
//!
//! Both ends expose named targets whose methods are called over the wire.
//! A target registers under a string id; methods are numbered with `u16`
//! tags the two sides agree on out of band. A call that expects a result
//! carries a correlation id and parks on a [`CallTable`] entry until the
//! reply, fault, or teardown resolves it.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::net::{ARG_ARGS, ARG_CALL, ARG_MESSAGE, ARG_METHOD, ARG_RESULT, ARG_TARGET};
use crate::wire::command::{KIND_FAULT, KIND_INVOKE, KIND_REPLY, MAX_ARGS};
use crate::wire::value::{put_i32, WireReader};
use crate::wire::{Command, Value, WireError};

// =============================================================================
// TYPES
// =============================================================================

/// Errors surfaced by remote calls.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The far side reported a failure instead of a result.
    #[error("remote fault: {0}")]
    Fault(String),

    /// The connection tore down before a result arrived.
    #[error("call cancelled before a result arrived")]
    Cancelled,

    /// Arguments would not encode.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl RemoteError {
    /// Fault with the given message, for target implementations.
    pub fn fault(message: impl Into<String>) -> Self {
        RemoteError::Fault(message.into())
    }
}

/// Something callable from the far side of a connection.
///
/// Implementations decide their own method numbering and argument shapes.
/// Returning `Ok(None)` answers a result-expecting caller with a null.
pub trait RemoteTarget: Send + Sync {
    /// Dispatch method `method` called by `caller` with `args`.
    fn invoke(&self, caller: &str, method: u16, args: Vec<Value>) -> Result<Option<Value>, RemoteError>;
}

/// Targets reachable from the far side, keyed by string id.
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    targets: Arc<RwLock<HashMap<String, Arc<dyn RemoteTarget>>>>,
}

/// Calls awaiting replies, keyed by correlation id.
#[derive(Clone, Default)]
pub struct CallTable {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<CallOutcome>>>>,
}

pub(crate) enum CallOutcome {
    Result(Option<Value>),
    Fault(String),
}

/// Handle on one in-flight call.
pub struct RemoteCall {
    rx: oneshot::Receiver<CallOutcome>,
}

// =============================================================================
// REGISTRY
// =============================================================================

impl RemoteRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `target` under `id`, replacing any previous holder.
    pub async fn register(&self, id: impl Into<String>, target: Arc<dyn RemoteTarget>) {
        self.targets.write().await.insert(id.into(), target);
    }

    /// Remove the target under `id`. Returns whether one was registered.
    pub async fn unregister(&self, id: &str) -> bool {
        self.targets.write().await.remove(id).is_some()
    }

    /// Whether a target is registered under `id`.
    pub async fn contains(&self, id: &str) -> bool {
        self.targets.read().await.contains_key(id)
    }

    /// Handle an incoming invoke command from `caller`.
    ///
    /// Returns the reply or fault to send back, or `None` for a call that
    /// expects no result. Failures of result-less calls are only logged.
    pub async fn dispatch(&self, caller: &str, command: &Command) -> Option<Command> {
        let call = command.get_str(ARG_CALL).map(str::to_string);

        let Some(target_id) = command.get_str(ARG_TARGET) else {
            return faulted(caller, call, "invoke carries no target".to_string());
        };
        let method = command
            .get_i32(ARG_METHOD)
            .and_then(|m| u16::try_from(m).ok());
        let Some(method) = method else {
            return faulted(caller, call, format!("invoke on `{target_id}` carries no method tag"));
        };
        let args = match command.get_sync(ARG_ARGS) {
            Some(bytes) => match decode_args(bytes) {
                Ok(args) => args,
                Err(err) => {
                    return faulted(caller, call, format!("bad argument payload: {err}"));
                }
            },
            None => Vec::new(),
        };

        let target = self.targets.read().await.get(target_id).cloned();
        let Some(target) = target else {
            return faulted(caller, call, format!("unknown target `{target_id}`"));
        };

        match target.invoke(caller, method, args) {
            Ok(result) => call.map(|call| reply_command(&call, result)),
            Err(err) => faulted(caller, call, err.to_string()),
        }
    }
}

fn faulted(caller: &str, call: Option<String>, message: String) -> Option<Command> {
    match call {
        Some(call) => Some(fault_command(&call, &message)),
        None => {
            warn!(caller, %message, "result-less invoke failed");
            None
        }
    }
}

// =============================================================================
// CALL TABLE
// =============================================================================

impl CallTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pending call, yielding its correlation id and the handle
    /// that resolves when an answer arrives.
    pub async fn open(&self) -> (String, RemoteCall) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        (id, RemoteCall { rx })
    }

    /// Feed a reply or fault command to its waiting call.
    ///
    /// Returns whether a call was actually waiting under that id.
    pub async fn resolve(&self, command: &Command) -> bool {
        let Some(call) = command.get_str(ARG_CALL) else {
            return false;
        };
        let Some(tx) = self.pending.lock().await.remove(call) else {
            return false;
        };

        let outcome = if command.kind() == KIND_FAULT {
            let message = command
                .get_str(ARG_MESSAGE)
                .unwrap_or("unspecified fault")
                .to_string();
            CallOutcome::Fault(message)
        } else {
            let result = match command.get(ARG_RESULT) {
                Some(Value::Null) | None => None,
                Some(value) => Some(value.clone()),
            };
            CallOutcome::Result(result)
        };
        tx.send(outcome).is_ok()
    }

    /// Drop one pending call without an answer, as when its invoke never
    /// made it onto the queue.
    pub(crate) async fn abandon(&self, call: &str) {
        self.pending.lock().await.remove(call);
    }

    /// Drop every pending call; each waiter resolves to cancelled.
    pub async fn cancel_all(&self) {
        self.pending.lock().await.clear();
    }

    /// Number of calls still waiting.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether no call is waiting.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

impl RemoteCall {
    /// Wait for the answer.
    pub async fn result(self) -> Result<Option<Value>, RemoteError> {
        match self.rx.await {
            Ok(CallOutcome::Result(value)) => Ok(value),
            Ok(CallOutcome::Fault(message)) => Err(RemoteError::Fault(message)),
            Err(_) => Err(RemoteError::Cancelled),
        }
    }
}

// =============================================================================
// COMMAND FORMS
// =============================================================================

/// Build the invoke command for `target.method(args)`, correlated under
/// `call` when the caller expects a result.
pub(crate) fn invoke_command(
    target: &str,
    method: u16,
    args: &[Value],
    call: Option<&str>,
) -> Result<Command, WireError> {
    let mut command = Command::new(KIND_INVOKE)
        .with(ARG_TARGET, target)
        .with(ARG_METHOD, i32::from(method));
    if !args.is_empty() {
        command.set(ARG_ARGS, Value::Sync(encode_args(args)?));
    }
    if let Some(call) = call {
        command.set(ARG_CALL, call);
    }
    Ok(command)
}

pub(crate) fn reply_command(call: &str, result: Option<Value>) -> Command {
    Command::new(KIND_REPLY)
        .with(ARG_CALL, call)
        .with(ARG_RESULT, result.unwrap_or(Value::Null))
}

pub(crate) fn fault_command(call: &str, message: &str) -> Command {
    Command::new(KIND_FAULT)
        .with(ARG_CALL, call)
        .with(ARG_MESSAGE, message)
}

fn encode_args(args: &[Value]) -> Result<Vec<u8>, WireError> {
    if args.len() > MAX_ARGS as usize {
        return Err(WireError::BadArgCount(args.len() as i32));
    }
    let mut out = Vec::new();
    put_i32(&mut out, args.len() as i32);
    for arg in args {
        arg.write_tagged(&mut out)?;
    }
    Ok(out)
}

fn decode_args(bytes: &[u8]) -> Result<Vec<Value>, WireError> {
    let mut reader = WireReader::new(bytes);
    let count = reader.read_i32()?;
    if !(0..=MAX_ARGS).contains(&count) {
        return Err(WireError::BadArgCount(count));
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(Value::read_tagged(&mut reader)?);
    }
    if !reader.is_empty() {
        return Err(WireError::Trailing(reader.remaining()));
    }
    Ok(args)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Scorekeeper with method 0 = add(points), method 1 = total().
    struct ScorePad {
        total: std::sync::Mutex<i32>,
    }

    impl RemoteTarget for ScorePad {
        fn invoke(
            &self,
            _caller: &str,
            method: u16,
            args: Vec<Value>,
        ) -> Result<Option<Value>, RemoteError> {
            let mut total = self.total.lock().unwrap();
            match method {
                0 => {
                    let points = args
                        .first()
                        .and_then(Value::as_i32)
                        .ok_or_else(|| RemoteError::fault("add needs a point count"))?;
                    *total += points;
                    Ok(None)
                }
                1 => Ok(Some(Value::I32(*total))),
                other => Err(RemoteError::fault(format!("no method {other}"))),
            }
        }
    }

    fn score_pad() -> Arc<ScorePad> {
        Arc::new(ScorePad {
            total: std::sync::Mutex::new(0),
        })
    }

    #[tokio::test]
    async fn test_invoke_with_result_produces_reply() {
        let registry = RemoteRegistry::new();
        registry.register("score", score_pad()).await;

        let add = invoke_command("score", 0, &[Value::I32(7)], None).unwrap();
        assert!(registry.dispatch("alice", &add).await.is_none());

        let total = invoke_command("score", 1, &[], Some("call-1")).unwrap();
        let reply = registry.dispatch("alice", &total).await.unwrap();
        assert_eq!(reply.kind(), KIND_REPLY);
        assert_eq!(reply.get_str(ARG_CALL), Some("call-1"));
        assert_eq!(reply.get_i32(ARG_RESULT), Some(7));
    }

    #[tokio::test]
    async fn test_unknown_target_faults() {
        let registry = RemoteRegistry::new();
        let invoke = invoke_command("nowhere", 0, &[], Some("call-2")).unwrap();
        let fault = registry.dispatch("alice", &invoke).await.unwrap();
        assert_eq!(fault.kind(), KIND_FAULT);
        assert_eq!(fault.get_str(ARG_CALL), Some("call-2"));
        assert!(fault.get_str(ARG_MESSAGE).unwrap().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_resultless_failure_stays_silent() {
        let registry = RemoteRegistry::new();
        registry.register("score", score_pad()).await;

        let bad = invoke_command("score", 9, &[], None).unwrap();
        assert!(registry.dispatch("alice", &bad).await.is_none());
    }

    #[tokio::test]
    async fn test_reply_resolves_waiting_call() {
        let table = CallTable::new();
        let (id, call) = table.open().await;

        assert!(table.resolve(&reply_command(&id, Some(Value::I32(42)))).await);
        assert_eq!(call.result().await.unwrap(), Some(Value::I32(42)));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_fault_resolves_to_error() {
        let table = CallTable::new();
        let (id, call) = table.open().await;

        table.resolve(&fault_command(&id, "table on fire")).await;
        match call.result().await {
            Err(RemoteError::Fault(message)) => assert!(message.contains("fire")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_teardown_cancels_pending_calls() {
        let table = CallTable::new();
        let (_, call) = table.open().await;
        table.cancel_all().await;

        assert!(matches!(call.result().await, Err(RemoteError::Cancelled)));
        assert!(!table.resolve(&reply_command("gone", None)).await);
    }

    #[tokio::test]
    async fn test_null_result_reads_as_none() {
        let table = CallTable::new();
        let (id, call) = table.open().await;
        table.resolve(&reply_command(&id, None)).await;
        assert_eq!(call.result().await.unwrap(), None);
    }

    #[test]
    fn test_argument_lists_past_the_limit_are_refused() {
        let args = vec![Value::Null; MAX_ARGS as usize + 1];
        assert_eq!(
            encode_args(&args),
            Err(WireError::BadArgCount(MAX_ARGS + 1))
        );

        let mut bytes = Vec::new();
        put_i32(&mut bytes, -1);
        assert_eq!(decode_args(&bytes), Err(WireError::BadArgCount(-1)));
    }
}
