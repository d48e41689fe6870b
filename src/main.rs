use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voucherpay::application::{PaymentEngine, StatusView, Trigger};
use voucherpay::config::EngineConfig;
use voucherpay::domain::Reference;
use voucherpay::domain::ports::{
    NotifierRef, PaymentGatewayRef, TransactionLedgerRef, VoucherStoreRef,
};
use voucherpay::infrastructure::in_memory::{InMemoryTransactionLedger, InMemoryVoucherStore};
use voucherpay::interfaces::csv::VoucherReader;
use voucherpay::interfaces::http;
use voucherpay::interfaces::mpesa::{MpesaConfig, MpesaGateway, SANDBOX_BASE_URL};
use voucherpay::interfaces::paystack::{DEFAULT_BASE_URL, PaystackConfig, PaystackGateway};
use voucherpay::interfaces::sms::{DEFAULT_TEMPLATE, LogNotifier, SmsConfig, SmsNotifier};

#[derive(Parser)]
#[command(author, version, about = "Payment confirmation and voucher allocation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Payment provider that starts and verifies charges.
    #[arg(long, global = true, env = "PAYMENT_GATEWAY", value_enum, default_value_t = GatewayKind::Paystack)]
    gateway: GatewayKind,

    #[arg(long, global = true, env = "PAYSTACK_SECRET_KEY", hide_env_values = true)]
    paystack_secret_key: Option<String>,

    #[arg(long, global = true, env = "PAYSTACK_BASE_URL", default_value = DEFAULT_BASE_URL)]
    paystack_base_url: String,

    /// Where Paystack sends the payer after checkout.
    #[arg(long, global = true, env = "PAYSTACK_CALLBACK_URL")]
    callback_url: Option<String>,

    #[arg(long, global = true, env = "MPESA_CONSUMER_KEY", hide_env_values = true)]
    mpesa_consumer_key: Option<String>,

    #[arg(long, global = true, env = "MPESA_CONSUMER_SECRET", hide_env_values = true)]
    mpesa_consumer_secret: Option<String>,

    /// Paybill or till number receiving M-Pesa payments.
    #[arg(long, global = true, env = "MPESA_SHORT_CODE", default_value = "")]
    mpesa_short_code: String,

    #[arg(long, global = true, env = "MPESA_PASSKEY", hide_env_values = true)]
    mpesa_passkey: Option<String>,

    #[arg(long, global = true, env = "MPESA_BASE_URL", default_value = SANDBOX_BASE_URL)]
    mpesa_base_url: String,

    /// Public URL of this service's /confirm endpoint, for STK callbacks.
    #[arg(long, global = true, env = "MPESA_CALLBACK_URL", default_value = "")]
    mpesa_callback_url: String,

    #[arg(long, global = true, env = "SMS_API_URL")]
    sms_api_url: Option<String>,

    #[arg(long, global = true, env = "SMS_API_KEY", hide_env_values = true)]
    sms_api_key: Option<String>,

    #[arg(long, global = true, env = "SMS_PARTNER_ID", default_value = "")]
    sms_partner_id: String,

    #[arg(long, global = true, env = "SMS_SENDER_ID", default_value = "")]
    sms_sender_id: String,

    /// Message template; supports {voucher}, {username}, {password} and {reference}.
    #[arg(long, global = true, env = "SMS_TEMPLATE", default_value = DEFAULT_TEMPLATE)]
    sms_template: String,

    /// Seconds a payment may stay pending before it is expired. 0 disables expiry.
    #[arg(long, global = true, default_value_t = 900)]
    pending_ttl_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,
        /// Voucher CSV to load into the pool at startup.
        #[arg(long)]
        vouchers: Option<PathBuf>,
        /// Seconds between background sweeps. 0 disables them.
        #[arg(long, default_value_t = 60)]
        sweep_interval_secs: u64,
    },
    /// Reconcile one payment by reference and print its status.
    Recheck { reference: String },
    /// Expire stale payments, fulfil the voucher backlog and retry deliveries.
    Sweep,
    /// Load vouchers from a CSV file.
    ImportVouchers { file: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GatewayKind {
    Paystack,
    Mpesa,
}

type Stores = (TransactionLedgerRef, VoucherStoreRef);

fn in_memory_stores() -> Stores {
    (
        Arc::new(InMemoryTransactionLedger::new()),
        Arc::new(InMemoryVoucherStore::new()),
    )
}

#[cfg(feature = "storage-rocksdb")]
fn persistent_stores(path: &Path) -> Result<Stores> {
    use voucherpay::infrastructure::rocksdb::RocksDBStore;

    let store = RocksDBStore::open(path).into_diagnostic()?;
    Ok((Arc::new(store.clone()), Arc::new(store)))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn persistent_stores(_path: &Path) -> Result<Stores> {
    eprintln!(
        "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
    );
    Ok(in_memory_stores())
}

fn notifier(cli: &Cli) -> Result<NotifierRef> {
    match (&cli.sms_api_url, &cli.sms_api_key) {
        (Some(api_url), Some(api_key)) => {
            let notifier = SmsNotifier::new(SmsConfig {
                api_url: api_url.clone(),
                api_key: api_key.clone(),
                partner_id: cli.sms_partner_id.clone(),
                sender_id: cli.sms_sender_id.clone(),
                template: cli.sms_template.clone(),
                timeout: Duration::from_secs(15),
            })
            .into_diagnostic()?;
            Ok(Arc::new(notifier))
        }
        _ => Ok(Arc::new(LogNotifier)),
    }
}

fn gateway(cli: &Cli) -> Result<PaymentGatewayRef> {
    match cli.gateway {
        GatewayKind::Paystack => {
            let secret_key = cli.paystack_secret_key.clone().unwrap_or_default();
            if secret_key.is_empty() {
                warn!("no Paystack secret key configured; gateway calls will be refused");
            }
            let gateway = PaystackGateway::new(PaystackConfig {
                base_url: cli.paystack_base_url.clone(),
                callback_url: cli.callback_url.clone(),
                ..PaystackConfig::new(secret_key)
            })
            .into_diagnostic()?;
            Ok(Arc::new(gateway))
        }
        GatewayKind::Mpesa => {
            let (Some(key), Some(secret), Some(passkey)) = (
                &cli.mpesa_consumer_key,
                &cli.mpesa_consumer_secret,
                &cli.mpesa_passkey,
            ) else {
                return Err(miette::miette!(
                    "M-Pesa needs --mpesa-consumer-key, --mpesa-consumer-secret and --mpesa-passkey"
                ));
            };
            if cli.mpesa_callback_url.is_empty() {
                warn!("no M-Pesa callback URL configured; payments will only settle by polling");
            }
            let gateway = MpesaGateway::new(MpesaConfig {
                base_url: cli.mpesa_base_url.clone(),
                ..MpesaConfig::new(
                    key.as_str(),
                    secret.as_str(),
                    cli.mpesa_short_code.as_str(),
                    passkey.as_str(),
                    cli.mpesa_callback_url.as_str(),
                )
            })
            .into_diagnostic()?;
            Ok(Arc::new(gateway))
        }
    }
}

fn build_engine(cli: &Cli) -> Result<PaymentEngine> {
    let (ledger, vouchers) = match &cli.db_path {
        Some(path) => persistent_stores(path)?,
        None => in_memory_stores(),
    };

    let config = EngineConfig {
        pending_ttl: (cli.pending_ttl_secs > 0).then(|| Duration::from_secs(cli.pending_ttl_secs)),
        ..EngineConfig::default()
    };

    Ok(PaymentEngine::new(
        ledger,
        vouchers,
        gateway(cli)?,
        notifier(cli)?,
        config,
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{json}");
    Ok(())
}

async fn import(engine: &PaymentEngine, file: &Path) -> Result<()> {
    let file = File::open(file).into_diagnostic()?;
    let reader = VoucherReader::new(file);
    let report = engine
        .import_vouchers(reader.vouchers())
        .await
        .into_diagnostic()?;
    print_json(&report)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voucherpay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = build_engine(&cli)?;

    match &cli.command {
        Command::Serve {
            listen,
            vouchers,
            sweep_interval_secs,
        } => {
            if let Some(file) = vouchers {
                import(&engine, file).await?;
            }
            let engine = Arc::new(engine);

            if *sweep_interval_secs > 0 {
                let engine = engine.clone();
                let period = Duration::from_secs(*sweep_interval_secs);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if let Err(e) = engine.sweep().await {
                            warn!(error = %e, "background sweep failed");
                        }
                    }
                });
                info!(every_secs = *sweep_interval_secs, "background sweep scheduled");
            }

            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .into_diagnostic()?;
            http::serve(listener, engine).await.into_diagnostic()?;
        }
        Command::Recheck { reference } => {
            let reference = Reference::new(reference.as_str()).into_diagnostic()?;
            let confirmation = engine
                .confirm(&reference, Trigger::Manual)
                .await
                .into_diagnostic()?;
            print_json(&StatusView::from(&confirmation))?;
        }
        Command::Sweep => {
            let report = engine.sweep().await.into_diagnostic()?;
            print_json(&report)?;
        }
        Command::ImportVouchers { file } => {
            import(&engine, file).await?;
        }
    }

    Ok(())
}
