//! Wiring: topics, identity-scoped stores and publishers, subscriptions,
//! scheduler, join coordinator and the HTTP server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use datafeed_core::{AccessPolicy, PipelineConfig, Principal, Settings};
use datafeed_queue::{
    Backoff, DeadLetterQueue, GuardedPublisher, PushHandler, PushSubscription, PushTokenVerifier, RequireInvoker,
    SubscriptionConfig, SubscriptionStats, Topic,
};
use datafeed_storage::{GuardedLandingStore, LandingStore, ObjectLandingStore, StorageBackend};
use datafeed_warehouse::{GuardedWarehouse, Warehouse};

use crate::error::PipelineError;
use crate::fetcher::FetcherRegistry;
use crate::http::{build_router, AppState, PushRoute};
use crate::ingest::{IngestionWorker, PublishRetry};
use crate::join::JoinCoordinator;
use crate::loader::WarehouseLoader;
use crate::metrics::PipelineMetrics;
use crate::scheduler::Scheduler;

pub const TRIGGER_TOPIC: &str = "fetch-requests";
pub const NOTIFICATION_TOPIC: &str = "landed-objects";
pub const INGEST_SUBSCRIPTION: &str = "ingest";
pub const LOAD_SUBSCRIPTION: &str = "load";

struct Stage {
    subscription: &'static str,
    topic: Arc<Topic>,
    invoker: Principal,
    handler: Arc<dyn PushHandler>,
}

/// A fully wired pipeline. Nothing runs until [`Pipeline::start`].
pub struct Pipeline {
    settings: Settings,
    pub policy: Arc<AccessPolicy>,
    pub trigger: Arc<Topic>,
    pub notifications: Arc<Topic>,
    /// Unguarded landing store, for inspection.
    pub landing: Arc<dyn LandingStore>,
    pub warehouse: Arc<Warehouse>,
    pub scheduler: Arc<Scheduler>,
    pub joins: Arc<JoinCoordinator>,
    pub metrics: PipelineMetrics,
    pub dead_letters: Arc<DeadLetterQueue>,
    stages: Vec<Stage>,
    subscriptions: Vec<PushSubscription>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Arc<Notify>,
}

impl Pipeline {
    /// Open the landing store and warehouse named by `settings`.
    pub fn from_settings(
        settings: Settings,
        config: &PipelineConfig,
        fetchers: FetcherRegistry,
    ) -> Result<Self, PipelineError> {
        let landing = Arc::new(ObjectLandingStore::new(StorageBackend::from_settings(&settings.landing)?));
        let warehouse = Arc::new(Warehouse::from_settings(&settings.warehouse)?);
        Self::with_stores(settings, config, fetchers, landing, warehouse)
    }

    pub fn with_stores(
        settings: Settings,
        config: &PipelineConfig,
        fetchers: FetcherRegistry,
        landing: Arc<dyn LandingStore>,
        warehouse: Arc<Warehouse>,
    ) -> Result<Self, PipelineError> {
        let ids = settings.identities.clone();
        let dataset = settings.warehouse.dataset.clone();
        let policy = Arc::new(AccessPolicy::least_privilege(
            &ids,
            TRIGGER_TOPIC,
            NOTIFICATION_TOPIC,
            &dataset,
        ));
        let trigger = Topic::new(TRIGGER_TOPIC);
        let notifications = Topic::new(NOTIFICATION_TOPIC);
        let metrics = PipelineMetrics::new();

        let landing_as = |principal: &Principal| -> Arc<dyn LandingStore> {
            Arc::new(GuardedLandingStore::new(landing.clone(), principal.clone(), policy.clone()))
        };
        let warehouse_as =
            |principal: &Principal| GuardedWarehouse::new(warehouse.clone(), principal.clone(), policy.clone());

        let scheduler = Scheduler::from_config(
            config,
            Arc::new(GuardedPublisher::new(trigger.clone(), ids.scheduler.clone(), policy.clone())),
            metrics.clone(),
        )?;

        let ingest = IngestionWorker::new(
            fetchers,
            landing_as(&ids.ingest),
            Arc::new(GuardedPublisher::new(notifications.clone(), ids.ingest.clone(), policy.clone())),
            settings.timeouts.fetch,
            metrics.clone(),
        )
        .with_publish_retry(PublishRetry {
            attempts: settings.bus.publish_retry_attempts,
            backoff: Backoff::new(settings.bus.min_backoff, settings.bus.max_backoff),
        });

        let loader = WarehouseLoader::new(
            warehouse_as(&ids.load),
            landing_as(&ids.load),
            &dataset,
            settings.timeouts.load,
            metrics.clone(),
        )
        .with_config(config);

        let joins = JoinCoordinator::new(
            config,
            warehouse_as(&ids.join),
            &dataset,
            settings.timeouts.join,
            metrics.clone(),
        );

        // The bus invokes each stage as that stage's own identity.
        let stages = vec![
            Stage {
                subscription: INGEST_SUBSCRIPTION,
                topic: trigger.clone(),
                invoker: ids.ingest.clone(),
                handler: Arc::new(RequireInvoker::new(ids.ingest.clone(), ingest)),
            },
            Stage {
                subscription: LOAD_SUBSCRIPTION,
                topic: notifications.clone(),
                invoker: ids.load.clone(),
                handler: Arc::new(RequireInvoker::new(ids.load.clone(), loader)),
            },
        ];

        Ok(Self {
            settings,
            policy,
            trigger,
            notifications,
            landing,
            warehouse,
            scheduler: Arc::new(scheduler),
            joins: Arc::new(joins),
            metrics,
            dead_letters: Arc::new(DeadLetterQueue::new()),
            stages,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start push subscriptions, schedule loops and the join coordinator.
    pub fn start(&mut self) {
        if !self.subscriptions.is_empty() {
            warn!("pipeline already started");
            return;
        }
        let bus = &self.settings.bus;
        for stage in &self.stages {
            let config = SubscriptionConfig::new(stage.subscription, stage.invoker.clone())
                .ack_deadline(bus.ack_deadline)
                .max_delivery_attempts(bus.max_delivery_attempts)
                .backoff(Backoff::new(bus.min_backoff, bus.max_backoff));
            self.subscriptions.push(PushSubscription::spawn(
                &stage.topic,
                stage.handler.clone(),
                config,
                self.dead_letters.clone(),
                self.shutdown.clone(),
            ));
        }

        self.tasks.extend(self.scheduler.spawn(self.shutdown.clone()));

        let joins = self.joins.clone();
        let poll = self.settings.timeouts.join_poll;
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move { joins.run(poll, shutdown).await }));

        info!(
            subscriptions = self.subscriptions.len(),
            tasks = self.tasks.len(),
            "pipeline started"
        );
    }

    pub fn subscription_stats(&self) -> Vec<(String, Arc<SubscriptionStats>)> {
        self.subscriptions
            .iter()
            .map(|s| (s.name.clone(), s.stats.clone()))
            .collect()
    }

    /// Router serving the push endpoint and operator endpoints.
    pub fn router(&self) -> Router {
        let verifier = self
            .settings
            .auth
            .push_token_secret
            .as_deref()
            .map(|secret| PushTokenVerifier::hs256(secret, &self.settings.auth.push_audience));
        let routes: HashMap<String, PushRoute> = self
            .stages
            .iter()
            .map(|stage| {
                let route = PushRoute {
                    handler: stage.handler.clone(),
                    invoker: stage.invoker.clone(),
                    topic: stage.topic.name().to_string(),
                };
                (stage.subscription.to_string(), route)
            })
            .collect();
        build_router(Arc::new(AppState {
            verifier,
            routes,
            subscriptions: self.subscription_stats(),
            dead_letters: self.dead_letters.clone(),
            joins: self.joins.clone(),
            metrics: self.metrics.clone(),
        }))
    }

    /// Stop every loop and subscription. In-flight handler tasks finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Start everything, serve HTTP until SIGINT/SIGTERM, then shut down.
    pub async fn serve(mut self) -> Result<(), PipelineError> {
        self.start();
        let addr: SocketAddr = format!("{}:{}", self.settings.server.host, self.settings.server.port)
            .parse()
            .map_err(|e| {
                PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad server address: {e}"),
                ))
            })?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "HTTP server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(os_signal())
            .await?;

        info!("shutting down pipeline");
        self.shutdown();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "pipeline task ended abnormally");
            }
        }
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM (Ctrl-C elsewhere).
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to register signal handlers; falling back to ctrl_c");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for ctrl_c");
                    std::future::pending::<()>().await;
                }
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}
