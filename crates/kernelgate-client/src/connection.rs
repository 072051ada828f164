//! One kernel lifecycle: launch over HTTP, execution channel, teardown.
//!
//! A `Connection` is created already open. `open` is the expensive step: the
//! gateway starts a container-backed kernel for it. Readiness is confirmed
//! with a `kernel_info_request`/`kernel_info_reply` round trip; launch,
//! channel connect and handshake together must finish within the startup
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use kernelgate_types::{KernelIdentity, KernelSpec, MsgType, ProtocolMessage, SessionId};

use crate::error::GatewayError;
use crate::gateway::{KernelLifecycle, MessageChannel};

/// An open kernel with its execution channel.
pub struct Connection {
    identity: KernelIdentity,
    session_id: SessionId,
    lifecycle: Arc<dyn KernelLifecycle>,
    channel: Option<Box<dyn MessageChannel>>,
    /// Set once the gateway has been asked to shut the kernel down.
    released: bool,
}

impl Connection {
    /// Launch a kernel for `spec` and wait until it answers on its channel.
    ///
    /// Fails with `LaunchTimeout` if the whole sequence outlasts
    /// `startup_timeout`, or `LaunchRejected` if the gateway refuses the
    /// launch. A kernel that was launched but never became ready is shut
    /// down before returning.
    #[instrument(name = "session.open", skip(lifecycle, spec), fields(kernel = %spec.name))]
    pub async fn open(
        lifecycle: Arc<dyn KernelLifecycle>,
        spec: &KernelSpec,
        startup_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let session_id = SessionId::new();
        let started = Instant::now();
        let mut launched = LaunchGuard {
            lifecycle: Arc::clone(&lifecycle),
            kernel: None,
        };

        let outcome = tokio::time::timeout(
            startup_timeout,
            establish(lifecycle.as_ref(), spec, &session_id, &mut launched.kernel),
        )
        .await;

        let error = match outcome {
            Ok(Ok(channel)) => {
                let Some(identity) = launched.kernel.take() else {
                    return Err(GatewayError::Protocol("kernel ready without identity".into()));
                };
                info!(
                    kernel_id = %identity.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "kernel ready"
                );
                return Ok(Self {
                    identity,
                    session_id,
                    lifecycle,
                    channel: Some(channel),
                    released: false,
                });
            }
            Ok(Err(e)) => e,
            Err(_) => GatewayError::LaunchTimeout(startup_timeout),
        };

        if let Some(identity) = launched.kernel.take() {
            warn!(kernel_id = %identity.id, error = %error, "kernel never became ready, shutting it down");
            if let Err(e) = lifecycle.shutdown(&identity.id).await {
                debug!(kernel_id = %identity.id, error = %e, "shutdown after failed open");
            }
        }
        Err(error)
    }

    pub fn identity(&self) -> &KernelIdentity {
        &self.identity
    }

    /// The client session id this connection's messages are stamped with.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn send(&self, msg: ProtocolMessage) -> Result<(), GatewayError> {
        match &self.channel {
            Some(channel) => channel.send(msg).await,
            None => Err(GatewayError::ChannelClosed),
        }
    }

    /// Wait up to `timeout` for the next inbound message.
    pub async fn receive(&mut self, timeout: Duration) -> Result<ProtocolMessage, GatewayError> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(GatewayError::ChannelClosed);
        };
        match tokio::time::timeout(timeout, channel.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => {
                debug!(kernel_id = %self.identity.id, "channel closed by peer");
                if let Some(mut channel) = self.channel.take() {
                    channel.close().await;
                }
                Err(GatewayError::ChannelClosed)
            }
            Err(_) => Err(GatewayError::ReceiveTimeout(timeout)),
        }
    }

    /// Ask the kernel to stop what it is running.
    pub async fn interrupt(&self) -> Result<(), GatewayError> {
        self.lifecycle.interrupt(&self.identity.id).await
    }

    /// Close the channel and ask the gateway to shut the kernel down.
    ///
    /// Idempotent; shutdown failures are logged, never returned.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        if self.released {
            return;
        }
        self.released = true;
        match self.lifecycle.shutdown(&self.identity.id).await {
            Ok(()) => debug!(kernel_id = %self.identity.id, "kernel shut down"),
            Err(e) => warn!(kernel_id = %self.identity.id, error = %e, "kernel shutdown failed"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped without close.
        shutdown_in_background(Arc::clone(&self.lifecycle), self.identity.clone());
    }
}

/// Holds a launched kernel until `open` either hands it to a `Connection`
/// or shuts it down. If the `open` future is dropped in between, the kernel
/// is shut down in the background.
struct LaunchGuard {
    lifecycle: Arc<dyn KernelLifecycle>,
    kernel: Option<KernelIdentity>,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        let Some(identity) = self.kernel.take() else {
            return;
        };
        shutdown_in_background(Arc::clone(&self.lifecycle), identity);
    }
}

fn shutdown_in_background(lifecycle: Arc<dyn KernelLifecycle>, identity: KernelIdentity) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(kernel_id = %identity.id, "no runtime to shut the kernel down from; kernel left running");
        return;
    };
    handle.spawn(async move {
        if let Err(e) = lifecycle.shutdown(&identity.id).await {
            warn!(kernel_id = %identity.id, error = %e, "background kernel shutdown failed");
        }
    });
}

async fn establish(
    lifecycle: &dyn KernelLifecycle,
    spec: &KernelSpec,
    session_id: &SessionId,
    launched: &mut Option<KernelIdentity>,
) -> Result<Box<dyn MessageChannel>, GatewayError> {
    let identity = lifecycle.launch(spec).await?;
    let kernel_id = identity.id.clone();
    *launched = Some(identity);

    let mut channel = lifecycle.open_channel(&kernel_id, session_id).await?;

    let request = ProtocolMessage::kernel_info_request(session_id);
    let request_id = request.msg_id().clone();
    channel.send(request).await?;

    loop {
        let Some(msg) = channel.recv().await else {
            return Err(GatewayError::ChannelClosed);
        };
        if msg.msg_type() == &MsgType::KernelInfoReply && msg.is_reply_to(&request_id) {
            debug!(kernel_id = %kernel_id, "kernel_info_reply received");
            return Ok(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockGateway, Script};

    fn spec() -> KernelSpec {
        KernelSpec::new("python3")
    }

    #[tokio::test]
    async fn test_open_confirms_readiness() {
        let gateway = MockGateway::new();
        let conn = Connection::open(gateway.lifecycle(), &spec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(conn.is_open());
        assert_eq!(gateway.launches(), 1);
        assert_eq!(conn.identity().name, "python3");
    }

    #[tokio::test]
    async fn test_rejected_launch_surfaces_status() {
        let gateway = MockGateway::new().with_script(Script::RejectLaunch(404));
        let err = Connection::open(gateway.lifecycle(), &spec(), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::LaunchRejected { status: 404, .. }));
        assert_eq!(gateway.shutdowns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_kernel_times_out_and_is_shut_down() {
        let gateway = MockGateway::new().with_script(Script::NeverReady);
        let err = Connection::open(gateway.lifecycle(), &spec(), Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::LaunchTimeout(_)));
        assert!(err.is_transient());
        assert_eq!(gateway.shutdowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_open_shuts_the_kernel_down() {
        let gateway = MockGateway::new().with_script(Script::NeverReady);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            Connection::open(gateway.lifecycle(), &spec(), Duration::from_secs(30)),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.launches(), 1);
        assert_eq!(gateway.shutdowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_abandoned_mid_launch_has_nothing_to_shut_down() {
        let gateway = MockGateway::new().slow_launches(Duration::from_secs(1));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            Connection::open(gateway.lifecycle(), &spec(), Duration::from_secs(30)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::task::yield_now().await;
        assert_eq!(gateway.shutdowns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out() {
        let gateway = MockGateway::new();
        let mut conn = Connection::open(gateway.lifecycle(), &spec(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = conn.receive(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, GatewayError::ReceiveTimeout(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let gateway = MockGateway::new();
        let mut conn = Connection::open(gateway.lifecycle(), &spec(), Duration::from_secs(1))
            .await
            .unwrap();

        conn.close().await;
        conn.close().await;

        assert_eq!(gateway.shutdowns(), 1);
        assert!(!conn.is_open());
        let session = *conn.session_id();
        let err = conn
            .send(ProtocolMessage::execute_request(&session, "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ChannelClosed));
        assert!(matches!(
            conn.receive(Duration::from_millis(10)).await,
            Err(GatewayError::ChannelClosed)
        ));
    }
}
