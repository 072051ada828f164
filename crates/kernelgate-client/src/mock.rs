//! In-process scripted gateway for tests.
//!
//! `MockGateway` implements [`KernelLifecycle`] and hands out channels that
//! answer like a tiny kernel, so session, pool and decorator logic can be
//! exercised without sockets.
//!
//! What the scripted kernel does with `code`:
//!
//! | Code                    | Reply                                               |
//! |-------------------------|-----------------------------------------------------|
//! | `a+b` / integer literal | `execute_result` with the integer                   |
//! | `print(x)`              | `stream` stdout `x\n`                               |
//! | `chatty`                | stdout `a`, stderr `b`, stdout `c`                  |
//! | `noise`                 | a stray stream for an unrelated parent, then `ok`   |
//! | `raise ...`             | `error` ZeroDivisionError + error `execute_reply`    |
//! | `hang`                  | `busy` and nothing else                             |
//! | `exit`                  | closes the channel                                  |
//!
//! Everything else produces an empty successful execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use kernelgate_types::{
    Channel, KernelId, KernelIdentity, KernelSpec, MsgType, ProtocolMessage, SessionId,
};

use crate::error::GatewayError;
use crate::gateway::{KernelLifecycle, MessageChannel};

/// Gateway-level behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Script {
    /// Launch and answer normally.
    Normal,
    /// Refuse every launch with this HTTP status.
    RejectLaunch(u16),
    /// Launch, but never answer the readiness handshake.
    NeverReady,
}

#[derive(Default)]
struct Counters {
    launches: AtomicU32,
    shutdowns: AtomicU32,
    interrupts: AtomicU32,
    failing_launches: AtomicU32,
    failing_sends: AtomicU32,
}

/// Scripted gateway. Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct MockGateway {
    script: Script,
    launch_delay: Duration,
    shutdown_delay: Duration,
    counters: Arc<Counters>,
    requests: Arc<Mutex<Vec<ProtocolMessage>>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            script: Script::Normal,
            launch_delay: Duration::ZERO,
            shutdown_delay: Duration::ZERO,
            counters: Arc::new(Counters::default()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    /// Every launch takes `delay` before the gateway answers.
    pub fn slow_launches(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Every shutdown is counted at once but takes `delay` to complete.
    pub fn slow_shutdowns(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    /// The next `n` launches fail with a transient transport error.
    pub fn failing_launches(self, n: u32) -> Self {
        self.counters.failing_launches.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` execute sends fail with a transient transport error.
    pub fn failing_sends(self, n: u32) -> Self {
        self.counters.failing_sends.store(n, Ordering::SeqCst);
        self
    }

    pub fn lifecycle(&self) -> Arc<dyn KernelLifecycle> {
        Arc::new(self.clone())
    }

    /// Launch attempts that reached the gateway, including failed ones.
    pub fn launches(&self) -> u32 {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u32 {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> u32 {
        self.counters.interrupts.load(Ordering::SeqCst)
    }

    /// Every execute_request the kernels received, in order.
    pub fn execute_requests(&self) -> Vec<ProtocolMessage> {
        self.requests.lock().clone()
    }
}

/// Decrement `counter` if positive; true when a failure should be injected.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl KernelLifecycle for MockGateway {
    async fn launch(&self, spec: &KernelSpec) -> Result<KernelIdentity, GatewayError> {
        let n = self.counters.launches.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if take_failure(&self.counters.failing_launches) {
            return Err(GatewayError::Transport("connection refused".into()));
        }
        if let Script::RejectLaunch(status) = self.script {
            return Err(GatewayError::LaunchRejected {
                status,
                message: format!("no such kernelspec: {}", spec.name),
            });
        }
        Ok(KernelIdentity {
            id: KernelId::from(format!("kernel-{n}")),
            name: spec.name.clone(),
        })
    }

    async fn shutdown(&self, _kernel: &KernelId) -> Result<(), GatewayError> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        if !self.shutdown_delay.is_zero() {
            tokio::time::sleep(self.shutdown_delay).await;
        }
        Ok(())
    }

    async fn interrupt(&self, _kernel: &KernelId) -> Result<(), GatewayError> {
        self.counters.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_channel(
        &self,
        _kernel: &KernelId,
        _session: &SessionId,
    ) -> Result<Box<dyn MessageChannel>, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MockChannel {
            gateway: self.clone(),
            outbound: Mutex::new(Some(tx)),
            inbound: rx,
        }))
    }
}

struct MockChannel {
    gateway: MockGateway,
    outbound: Mutex<Option<mpsc::UnboundedSender<ProtocolMessage>>>,
    inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
}

impl MockChannel {
    fn respond(&self, request: &ProtocolMessage) -> Option<Vec<ProtocolMessage>> {
        match request.msg_type() {
            MsgType::KernelInfoRequest if self.gateway.script == Script::NeverReady => Some(vec![]),
            MsgType::KernelInfoRequest => Some(vec![ProtocolMessage::reply_to(
                request,
                MsgType::KernelInfoReply,
                Channel::Shell,
                json!({"status": "ok", "protocol_version": "5.3"}),
            )]),
            MsgType::ExecuteRequest => {
                let code = request.content["code"].as_str().unwrap_or_default().trim();
                if code == "exit" {
                    return None;
                }
                Some(run(request, code))
            }
            _ => Some(vec![]),
        }
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn send(&self, msg: ProtocolMessage) -> Result<(), GatewayError> {
        let mut outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(GatewayError::ChannelClosed);
        };
        if msg.msg_type() == &MsgType::ExecuteRequest {
            if take_failure(&self.gateway.counters.failing_sends) {
                return Err(GatewayError::Transport("connection reset".into()));
            }
            self.gateway.requests.lock().push(msg.clone());
        }
        match self.respond(&msg) {
            Some(replies) => {
                for reply in replies {
                    let _ = tx.send(reply);
                }
            }
            None => *outbound = None,
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<ProtocolMessage> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.outbound.lock().take();
        self.inbound.close();
    }
}

fn run(request: &ProtocolMessage, code: &str) -> Vec<ProtocolMessage> {
    let iopub = |t: MsgType, content| ProtocolMessage::reply_to(request, t, Channel::Iopub, content);
    let stream = |name: &str, text: &str| iopub(MsgType::Stream, json!({"name": name, "text": text}));
    let reply = |content| ProtocolMessage::reply_to(request, MsgType::ExecuteReply, Channel::Shell, content);

    let mut out = vec![ProtocolMessage::status_for(request, "busy")];

    if code == "hang" {
        return out;
    }

    if let Some(value) = eval_int(code) {
        out.push(iopub(
            MsgType::ExecuteResult,
            json!({"data": {"text/plain": value.to_string()}, "execution_count": 1}),
        ));
        out.push(reply(json!({"status": "ok", "execution_count": 1})));
    } else if let Some(arg) = code.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
        out.push(stream("stdout", &format!("{}\n", arg.trim_matches(['"', '\'']))));
        out.push(reply(json!({"status": "ok", "execution_count": 1})));
    } else if code == "chatty" {
        out.push(stream("stdout", "a"));
        out.push(stream("stderr", "b"));
        out.push(stream("stdout", "c"));
        out.push(reply(json!({"status": "ok", "execution_count": 1})));
    } else if code == "noise" {
        let stray_parent = ProtocolMessage::execute_request(&SessionId::new(), "earlier");
        out.insert(
            0,
            ProtocolMessage::reply_to(
                &stray_parent,
                MsgType::Stream,
                Channel::Iopub,
                json!({"name": "stdout", "text": "stray"}),
            ),
        );
        out.push(ProtocolMessage::status_for(&stray_parent, "idle"));
        out.push(stream("stdout", "ok"));
        out.push(reply(json!({"status": "ok", "execution_count": 1})));
    } else if code.starts_with("raise") {
        let error = json!({
            "ename": "ZeroDivisionError",
            "evalue": "division by zero",
            "traceback": ["Traceback (most recent call last):", "ZeroDivisionError: division by zero"],
        });
        out.push(iopub(MsgType::Error, error.clone()));
        let mut content = error;
        content["status"] = json!("error");
        content["execution_count"] = json!(1);
        out.push(reply(content));
    } else {
        out.push(reply(json!({"status": "ok", "execution_count": 1})));
    }

    out.push(ProtocolMessage::status_for(request, "idle"));
    out
}

fn eval_int(code: &str) -> Option<i64> {
    match code.split_once('+') {
        Some((a, b)) => Some(a.trim().parse::<i64>().ok()? + b.trim().parse::<i64>().ok()?),
        None => code.parse().ok(),
    }
}
