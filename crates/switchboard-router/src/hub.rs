use crate::router::DelegationRouter;
use std::sync::Arc;
use switchboard_acp::{StdioTransport, StdioTransportConfig};
use switchboard_core::{
    AgentRegistry, NoopNotificationSink, NotificationSink, ProgressSink, SwitchboardConfig,
    ToolCall, ToolDescriptor, ToolResult, TracingProgressSink,
};
use switchboard_http::{HttpTransport, HttpTransportConfig};
use switchboard_orchestrator::{
    DelegationExecutor, DelegationTracker, ParallelOrchestrator, TransportExecutor,
};
use tracing::{info, warn};

/// Every delegation component, wired together from one configuration.
pub struct Switchboard {
    registry: Arc<AgentRegistry>,
    stdio: Arc<StdioTransport>,
    http: Arc<HttpTransport>,
    tracker: Arc<DelegationTracker>,
    orchestrator: ParallelOrchestrator,
    router: DelegationRouter,
}

impl Switchboard {
    /// Build with log-only progress and no user notifications.
    pub fn from_config(config: SwitchboardConfig) -> Self {
        Self::with_sinks(
            config,
            Arc::new(TracingProgressSink),
            Arc::new(NoopNotificationSink),
        )
    }

    pub fn with_sinks(
        config: SwitchboardConfig,
        progress: Arc<dyn ProgressSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let settings = config.delegation;
        let registry = Arc::new(AgentRegistry::new());
        registry.load_from_config(config.agents);

        let stdio = Arc::new(StdioTransport::new(
            registry.clone(),
            StdioTransportConfig::from(&settings),
        ));
        let http = Arc::new(HttpTransport::new(
            registry.clone(),
            HttpTransportConfig::from(&settings),
        ));
        let executor: Arc<dyn DelegationExecutor> = Arc::new(TransportExecutor::new(
            registry.clone(),
            stdio.clone(),
            http.clone(),
        ));
        let tracker = DelegationTracker::builder()
            .status_source(http.clone())
            .progress_sink(progress)
            .notification_sink(notifier)
            .poll_interval(settings.poll_interval())
            .build();

        let orchestrator =
            ParallelOrchestrator::new(executor.clone(), registry.clone(), tracker.clone());
        let router = DelegationRouter::new(
            registry.clone(),
            executor,
            stdio.clone(),
            tracker.clone(),
        )
        .with_retention(settings.run_retention());

        info!(agents = registry.agent_count(), "Switchboard initialized");
        Self {
            registry,
            stdio,
            http,
            tracker,
            orchestrator,
            router,
        }
    }

    /// Spawn every enabled stdio agent marked `auto_spawn`. Failures are
    /// logged and skipped. Returns how many agents came up.
    pub async fn auto_spawn(&self) -> usize {
        let candidates: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|a| a.definition.enabled && a.definition.auto_spawn && a.definition.is_spawnable())
            .map(|a| a.definition.name)
            .collect();

        let mut started = 0;
        for name in candidates {
            match self.stdio.spawn_agent(&name).await {
                Ok(()) => started += 1,
                Err(e) => warn!(agent = %name, error = %e, "Auto-spawn failed"),
            }
        }
        started
    }

    /// Route a call from the calling agent.
    pub async fn dispatch(&self, call: ToolCall) -> ToolResult {
        self.router.dispatch(call).await
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.router.descriptors()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<DelegationTracker> {
        &self.tracker
    }

    pub fn orchestrator(&self) -> &ParallelOrchestrator {
        &self.orchestrator
    }

    pub fn router(&self) -> &DelegationRouter {
        &self.router
    }

    pub fn stdio(&self) -> &Arc<StdioTransport> {
        &self.stdio
    }

    pub fn http(&self) -> &Arc<HttpTransport> {
        &self.http
    }

    /// Stop every agent process, abort in-flight HTTP runs and the poller.
    pub async fn shutdown(&self) {
        let cancelled = self.http.cancel_all_runs();
        self.stdio.stop_all().await;
        self.tracker.stop_poller();
        info!(cancelled_runs = cancelled, "Switchboard shut down");
    }
}
