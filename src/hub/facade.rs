//! C6 — Hub Facade: composes C1–C5 into the single entry point embedders
//! use, and owns the sweeper loop and the push server's lifetime.

use crate::hub::config::HubConfig;
use crate::hub::delivery::DeliveryEngineImpl;
use crate::hub::dispatch::DispatchFabricImpl;
use crate::hub::event_bus::EventBusImpl;
use crate::hub::push_server::PushServerState;
use crate::hub::registry::InstanceRegistryImpl;
use crate::hub::session::SessionTable;
use crate::hub::traits::{
    DeliveryEngine, DispatchFabric, EventBus, HealthStatus, HubHealth, HubStats, InstanceRegistry,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// The message hub: instance registry, delivery engine, dispatch fabric,
/// push server, and event bus, wired together and exposed as one handle.
///
/// Cloning a `Hub` is cheap; every field is an `Arc` over shared state, so
/// clones observe the same running hub (the same pattern used for the
/// router handle elsewhere in this codebase).
#[derive(Clone)]
pub struct Hub {
    registry: Arc<InstanceRegistryImpl>,
    engine: Arc<DeliveryEngineImpl>,
    dispatch: Arc<dyn DispatchFabric>,
    event_bus: Arc<dyn EventBus>,
    sessions: SessionTable,
    config: HubConfig,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
    push_server: Arc<Mutex<Option<Arc<PushServerState>>>>,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Hub {
    /// Builds a hub from a validated configuration. Does not start the
    /// sweeper loop or bind the push server; call [`Hub::start`] for that.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(InstanceRegistryImpl::new());
        let sessions = SessionTable::new();
        let event_bus: Arc<dyn EventBus> = Arc::new(EventBusImpl::new());
        let dispatch: Arc<dyn DispatchFabric> = Arc::new(DispatchFabricImpl::new(
            sessions.clone(),
            Arc::clone(&event_bus),
        ));
        let engine =
            DeliveryEngineImpl::new(Arc::clone(&registry) as Arc<dyn InstanceRegistry>, Arc::clone(&dispatch), config.clone());

        Self {
            registry,
            engine,
            dispatch,
            event_bus,
            sessions,
            config,
            shutdown: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            push_server: Arc::new(Mutex::new(None)),
            background_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The delivery engine, for embedders that want to call `send` directly
    /// rather than going through the push server's wire protocol.
    #[must_use]
    pub fn delivery_engine(&self) -> Arc<DeliveryEngineImpl> {
        Arc::clone(&self.engine)
    }

    /// The instance registry, for embedders inspecting presence directly.
    #[must_use]
    pub fn registry(&self) -> Arc<InstanceRegistryImpl> {
        Arc::clone(&self.registry)
    }

    /// The event bus, for embedders subscribing to lifecycle events
    /// in-process rather than over a push-server connection.
    #[must_use]
    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        Arc::clone(&self.event_bus)
    }

    /// Binds the push server and starts the sweeper loop. Runs until the
    /// listener is dropped or [`Hub::stop`] is called; await the returned
    /// future to block the caller on the server's lifetime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured push port cannot be bound.
    #[instrument(skip(self), fields(push_port = %self.config.push_port))]
    pub async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::Relaxed);
        self.spawn_sweeper().await;

        let state = PushServerState::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.engine),
            Arc::clone(&self.dispatch),
            self.sessions.clone(),
            self.config.heartbeat_timeout_ms.as_duration(),
            self.shutdown.clone(),
        );
        let heartbeat_handle = state.spawn_heartbeat_sweeper();
        self.background_tasks.lock().await.push(heartbeat_handle);
        *self.push_server.lock().await = Some(Arc::clone(&state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.push_port.into_inner()));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "push server listening");

        let router = PushServerState::router(state);
        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Shuts the hub down: stops axum from accepting new connections, closes
    /// every currently connected session (cancelling its `handle_socket`
    /// task and marking the instance offline), cancels every outstanding
    /// delivery timer and drops all tracked message state, then waits for
    /// the sweeper and heartbeat-sweeper loops to exit before returning.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        if let Some(state) = self.push_server.lock().await.take() {
            state.close_all_sessions().await;
        }

        self.engine.shutdown();

        let handles: Vec<_> = self.background_tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Whether `start` has been called and has not yet returned.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn spawn_sweeper(&self) {
        let engine = Arc::clone(&self.engine);
        let interval = self.config.sweeper_interval_ms.as_duration();
        let eviction_age = self.config.eviction_age_ms.as_duration();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = engine.sweep(eviction_age).await;
                        if evicted > 0 {
                            info!(evicted, "sweeper evicted stale tracked messages");
                        }
                    }
                    () = shutdown.cancelled() => return,
                }
            }
        });
        self.background_tasks.lock().await.push(handle);
    }

    /// Point-in-time operational snapshot.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            connected_sessions: self.sessions.len(),
            pending_messages: self.engine.all_pending().await.len(),
            instances: self.registry.snapshot(),
        }
    }

    /// Coarse health classification plus point-in-time counters.
    pub async fn health(&self) -> HubHealth {
        let mut features = Vec::new();
        if self.config.enhanced {
            features.push("enhanced".to_string());
        }

        let counters = self.engine.counters();
        let status = if counters.messages_failed > 0 && self.sessions.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HubHealth {
            status,
            features,
            counters,
        }
    }
}
