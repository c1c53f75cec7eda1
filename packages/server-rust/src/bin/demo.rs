//! Example application: an order endpoint that enqueues a persistent
//! event, a queue listener that runs a two-step saga, and a cron job that
//! reports queue depth.
//!
//! Configuration is read from `config/config.yaml` when present and from
//! `KEEL_*` environment variables.

use std::path::Path;
use std::sync::Arc;

use axum::extract::Path as UrlPath;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use keel::container::{Inject, Produce};
use keel::cron::middleware;
use keel::module::{Capability, CronProvider, HttpProvider, Module};
use keel::queue::{QueueFactory, QueueModule};
use keel::saga::{MemorySagaStore, SagaModule, SagaRegistry, Step, StepHandle, TxContext};
use keel::{App, Container, Scheduler};
use keel_core::events::listener_fn;
use keel_core::{Config, Dispatcher, Event, EventBus, SharedDispatcher, Topic};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    sku: String,
}

struct Orders {
    queues: Arc<QueueFactory>,
}

impl Module for Orders {
    fn name(&self) -> &str {
        "orders"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![Capability::Http(self.clone()), Capability::Cron(self)]
    }
}

impl HttpProvider for Orders {
    fn provide_http(&self, router: Router) -> Router {
        let queues = Arc::clone(&self.queues);
        router.route(
            "/orders/{sku}",
            post(move |UrlPath(sku): UrlPath<String>| {
                let queues = Arc::clone(&queues);
                async move {
                    let order = OrderPlaced {
                        order_id: Uuid::new_v4().to_string(),
                        sku,
                    };
                    let queued = match queues.make("default").await {
                        Ok(queue) => queue.dispatch(Event::persistent(order.clone())).await,
                        Err(e) => Err(e),
                    };
                    match queued {
                        Ok(()) => (StatusCode::ACCEPTED, order.order_id),
                        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
                    }
                }
            }),
        )
    }
}

impl CronProvider for Orders {
    fn provide_cron(&self, scheduler: &Scheduler) -> anyhow::Result<()> {
        let queues = Arc::clone(&self.queues);
        scheduler.add_with(
            "@every 30s",
            move |_| {
                let queues = Arc::clone(&queues);
                async move {
                    let queue = queues.make("default").await?;
                    let info = queue.driver().info().await?;
                    info!(queue = queue.name(), waiting = info.waiting, failed = info.failed, "order queue depth");
                    Ok(())
                }
            },
            [middleware::name("order-queue-depth"), middleware::skip_if_overlap()],
        )?;
        Ok(())
    }
}

struct Checkout {
    sagas: Arc<SagaRegistry>,
    reserve: StepHandle<String>,
    charge: StepHandle<String>,
}

impl Checkout {
    fn new(sagas: Arc<SagaRegistry>) -> Self {
        let reserve = sagas.add_step(Step::new(
            "reserve-stock",
            |_: TxContext, sku: String| async move {
                info!(%sku, "stock reserved");
                Ok(())
            },
            |_: TxContext, sku: String| async move {
                info!(%sku, "stock released");
                Ok(())
            },
        ));
        let charge = sagas.add_step(Step::new(
            "charge-card",
            |_: TxContext, order_id: String| async move {
                if order_id.ends_with('0') {
                    anyhow::bail!("card declined for {order_id}");
                }
                Ok(())
            },
            |_: TxContext, order_id: String| async move {
                info!(%order_id, "charge refunded");
                Ok(())
            },
        ));
        Self { sagas, reserve, charge }
    }

    async fn place(&self, order: &OrderPlaced) -> anyhow::Result<()> {
        let (tx, ctx) = self.sagas.start_tx().await?;
        let result = async {
            self.reserve.call(&ctx, order.sku.clone()).await?;
            self.charge.call(&ctx, order.order_id.clone()).await
        }
        .await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                warn!(order_id = %order.order_id, error = %format!("{e:#}"), "checkout failed, rolling back");
                tx.rollback().await?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut builder = Config::builder().env("KEEL");
    if Path::new("config/config.yaml").exists() {
        builder = builder.file("config/config.yaml");
    }
    let config = Arc::new(builder.build()?);
    let bus: SharedDispatcher = Arc::new(EventBus::new());

    let factory = Arc::new(QueueFactory::from_config(Arc::clone(&config), Arc::clone(&bus)));
    bus.subscribe(factory.reload_listener());

    let sagas = Arc::new(SagaRegistry::from_config(Arc::new(MemorySagaStore::new()), &config)?);
    let checkout = Arc::new(Checkout::new(Arc::clone(&sagas)));
    bus.subscribe(listener_fn(vec![Topic::decodable::<OrderPlaced>()], move |event| {
        let checkout = Arc::clone(&checkout);
        async move {
            match event.data::<OrderPlaced>() {
                Some(order) => checkout.place(order).await,
                None => Ok(()),
            }
        }
    }));

    let scheduler = Scheduler::builder()
        .middleware(middleware::recover())
        .middleware(middleware::logging())
        .build();

    let container = Container::new();
    container
        .supply(Arc::clone(&config))
        .supply(bus)
        .supply(scheduler)
        .supply(sagas)
        .provide_module({
            let factory = Arc::clone(&factory);
            move |()| Ok(Produce::new(Arc::new(QueueModule::new(Arc::clone(&factory)))).as_module())
        })
        .provide_module(|(Inject(registry), Inject(config)): (Inject<Arc<SagaRegistry>>, Inject<Arc<Config>>)| {
            Ok(Produce::new(Arc::new(SagaModule::from_config(registry, &config)?)).as_module())
        })
        .provide_module(move |()| {
            Ok(Produce::new(Arc::new(Orders {
                queues: Arc::clone(&factory),
            }))
            .as_module())
        });

    App::new("keel-demo", container).run(std::env::args()).await
}
