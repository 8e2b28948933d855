use crate::{cli::CliOpts, config::RuntimeConfig};
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use ledger_sync_core::{
	bootstrap::bootstrap,
	crawler::PeerCrawler,
	crypto::{Ed25519Keypair, Ed25519Verifier, Signer, Verifier},
	data::{FileDB, WriteQueue},
	ledger::Ledger,
	liveness::LivenessProber,
	network::{http::HttpTransport, PeerTransport},
	peer_registry::PeerRegistry,
	scheduler::{NodeJobs, TaskScheduler},
	self_peer::{SelfPeer, SelfPeerConfig},
	shutdown::{user_signal, Controller},
	sync::{ChainLinkValidator, StaticMembership, SyncEngine},
	utils::{default_subscriber, install_panic_hooks, json_subscriber},
};
use std::{fs, path::Path, sync::Arc};
use tracing::{error, info, span, warn, Level};

mod cli;
mod config;

async fn run(cfg: RuntimeConfig) -> Result<TaskScheduler> {
	let version = clap::crate_version!();
	info!("Running ledger sync node version: {version}");
	info!("Using data directory: {}", cfg.data_path);

	let queue = WriteQueue::new();
	let db = FileDB::open(&cfg.data_path, queue.clone());
	let ledger = Arc::new(
		Ledger::open(&cfg.data_path, db.clone(), queue, cfg.sync.ms_validity)
			.await
			.wrap_err("Failed to open the ledger")?,
	);
	if let Some(number) = ledger.current_number().await {
		info!(block_number = number, "Local chain loaded");
	}

	let verifier: Arc<dyn Verifier> = Arc::new(Ed25519Verifier);
	let registry = Arc::new(
		PeerRegistry::load(db, ledger.clone(), verifier.clone())
			.await
			.wrap_err("Failed to load the peer table")?,
	);

	let keypair = Ed25519Keypair::load_or_generate(Path::new(&cfg.secret_key_path()))
		.await
		.wrap_err("Failed to load the secret key")?;
	let pubkey = keypair.pubkey();
	info!(pubkey, "Node identity loaded");

	let transport: Arc<dyn PeerTransport> = Arc::new(
		HttpTransport::new(cfg.http_timeout).wrap_err("Failed to create the HTTP transport")?,
	);

	for endpoint in &cfg.bootstraps {
		if let Err(error) = bootstrap(
			endpoint,
			&cfg.currency,
			&*ledger,
			&*registry,
			transport.as_ref(),
			verifier.as_ref(),
		)
		.await
		{
			warn!(endpoint, %error, "Bootstrap failed");
		}
	}

	let self_peer = SelfPeer::new(
		ledger.clone(),
		registry.clone(),
		Arc::new(keypair),
		SelfPeerConfig::from(&cfg),
	);
	let crawler = PeerCrawler::new(
		registry.clone(),
		transport.clone(),
		verifier.clone(),
		pubkey.clone(),
		cfg.sync.enough_peers,
	);
	let sync = SyncEngine::new(
		ledger,
		registry.clone(),
		transport.clone(),
		verifier.clone(),
		Arc::new(ChainLinkValidator),
		Arc::new(StaticMembership::new(cfg.members.clone())),
		cfg.sync.clone(),
		pubkey.clone(),
	);
	let liveness = LivenessProber::new(registry, transport, verifier, pubkey);

	let jobs = NodeJobs {
		self_peer: Arc::new(self_peer),
		crawl: Arc::new(crawler),
		sync: Arc::new(sync),
		liveness: Arc::new(liveness),
	};
	Ok(TaskScheduler::start(jobs, &cfg.sync))
}

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {}", config_path))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	// Flags override the config parameters
	if let Some(data_path) = &opts.data_path {
		cfg.data_path = data_path.to_string();
	}
	if let Some(currency) = &opts.currency {
		cfg.currency = currency.to_string();
	}
	if let Some(port) = opts.port {
		cfg.remote_port = Some(port);
	}
	if let Some(bootstrap) = &opts.bootstrap {
		cfg.bootstraps.push(bootstrap.to_string());
	}

	if cfg.currency.is_empty() {
		return Err(eyre!("Currency is not configured"));
	}

	Ok(cfg)
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let mut shutdown = Controller::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.cancellation_token())?;

	if opts.clean && Path::new(&cfg.data_path).exists() {
		info!("Cleaning up local data directory");
		fs::remove_dir_all(&cfg.data_path).wrap_err("Failed to remove local data directory")?;
	}

	let span = span!(Level::INFO, "run", currency = cfg.currency.clone());
	// Do not enter span if logs format is not JSON
	let _enter = if cfg.log_format_json {
		Some(span.enter())
	} else {
		None
	};

	let monitor = shutdown
		.watch()
		.ok_or_else(|| eyre!("Shutdown already triggered"))?;

	let mut scheduler = match run(cfg).await {
		Ok(scheduler) => scheduler,
		Err(error) => {
			error!("{error:#}");
			return Err(error.wrap_err("Starting ledger sync node failed"));
		},
	};

	tokio::select! {
		_ = user_signal() => info!("User signaled shutdown"),
		_ = monitor.canceled() => warn!("Panic occurred, shutting down"),
	}
	drop(monitor);

	scheduler.stop_all().await;
	shutdown.shutdown().await;
	info!("Ledger sync node stopped");
	Ok(())
}
