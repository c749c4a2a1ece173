// Entry point: loads configuration, wires the store/adapters/services, and
// runs the scheduler, session arbiter, and admin HTTP surface together under
// one `tokio::main`. CLI shape and logging init follow the teacher's
// `storage_node` binary (`clap` `Parser`/`Subcommand`, `tracing_subscriber`
// registry with an `EnvFilter`).

use clap::{Parser, Subcommand};
use sbs_broker::arbiter::SessionArbiter;
use sbs_broker::config::AppConfig;
use sbs_broker::entitlement::{RegionEntitlementService, WireGuardEntitlementService};
use sbs_broker::notifications::{NotificationDispatcher, NotificationSender, ReminderKind};
use sbs_broker::referrals::ReferralLedger;
use sbs_broker::scheduler::Scheduler;
use sbs_broker::store::Store;
use sbs_broker::wireguard::WireGuardAdapter;
use sbs_broker::xray::XrayAdapter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations and start the scheduler, arbiter, and admin API.
    Run,
    /// Apply pending migrations and exit.
    Migrate,
    /// Run the daily admin kick report once, bypassing the 12:00 Amsterdam gate.
    KickReport {
        #[arg(long, default_value_t = true)]
        force: bool,
    },
}

/// Stand-in for the out-of-scope chat-bot front-end: logs every notification
/// rather than delivering it. Production deployments replace this with
/// whatever transport the bot surface exposes.
struct LoggingNotificationSender;

#[async_trait::async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, tg_id: i64, kind: &ReminderKind) -> sbs_broker::Result<()> {
        info!(tg_id, ?kind, "notification dispatched (logging sender)");
        Ok(())
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    let store = Store::open(&config.database_path)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            info!("migrations applied, exiting");
            return Ok(());
        }
        Commands::KickReport { force } => {
            let dispatcher = NotificationDispatcher::new(store, LoggingNotificationSender);
            let rows = dispatcher
                .run_daily_kick_report(sbs_broker::clock::utcnow(), force)
                .await?;
            info!(count = rows.as_ref().map(|r| r.len()).unwrap_or(0), "kick report sent");
            return Ok(());
        }
        Commands::Run => {}
    }

    let wireguard_adapter = WireGuardAdapter::new(&config.wireguard)?;
    let xray_adapter = XrayAdapter::new(&config.region_vpn)?;

    let wireguard_service = WireGuardEntitlementService::new(store.clone(), wireguard_adapter);
    let region_service = RegionEntitlementService::new(xray_adapter.clone());
    let referrals = ReferralLedger::new(store.clone(), config.referrals.hold_days, config.referrals.min_payout_rub);
    let dispatcher = Arc::new(NotificationDispatcher::new(store.clone(), LoggingNotificationSender));

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "sbs-broker".to_string());
    let scheduler_holder_id = format!("{hostname}-scheduler-{}", std::process::id());
    let arbiter_holder_id = format!("{hostname}-arbiter-{}", std::process::id());

    let scheduler = Scheduler::new(
        store.clone(),
        wireguard_service,
        region_service,
        referrals,
        NotificationDispatcher::new(store.clone(), LoggingNotificationSender),
        sbs_broker::scheduler::NoopYandexMembershipRotator,
        scheduler_holder_id,
    );

    let arbiter = SessionArbiter::new(store.clone(), xray_adapter, LoggingNotificationSender, arbiter_holder_id);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler_handle = tokio::spawn(scheduler.run(Duration::from_secs(config.scheduler_period_seconds), shutdown_rx.clone()));
    let arbiter_handle = tokio::spawn(
        arbiter.run(Duration::from_secs(config.region_vpn.session_guard_period_seconds), shutdown_rx.clone()),
    );

    let admin_state = Arc::new(sbs_broker::admin_api::AdminApiState { store: store.clone(), notifications: dispatcher });
    let admin_router = sbs_broker::admin_api::router(admin_state);
    let admin_addr: std::net::SocketAddr = config.admin_bind_addr.parse()?;
    info!(%admin_addr, "admin api listening");
    let admin_server = axum::Server::bind(&admin_addr).serve(admin_router.into_make_service());

    tokio::select! {
        res = admin_server => {
            if let Err(e) = res {
                error!(error = %e, "admin api server crashed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(scheduler_handle, arbiter_handle);

    Ok(())
}
