//! Periodic execution of the node jobs.
//!
//! Every job gets a ticker and a single worker draining a FIFO queue of triggers, so that one
//! execution of a given job is in flight at most, while different jobs run independently.
use crate::{
	crawler::{CrawlMode, PeerCrawler},
	data::Database,
	liveness::LivenessProber,
	self_peer::SelfPeer,
	shutdown::{Controller, Monitor},
	sync::SyncEngine,
	types::SyncConfig,
	utils::spawn_in_span,
};
use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::{
	sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
	time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
	SelfPeer,
	Crawl,
	Sync,
	Liveness,
}

impl fmt::Display for JobKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			JobKind::SelfPeer => "self_peer",
			JobKind::Crawl => "crawl",
			JobKind::Sync => "sync",
			JobKind::Liveness => "liveness",
		})
	}
}

/// Reason of a job execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
	Tick,
	/// Crawl regardless of the number of known peers.
	CrawlNow,
	/// Pull blocks from the given peer, or from every UP peer.
	Pull(Option<String>),
}

#[async_trait]
pub trait Job: Send + Sync {
	async fn run(&self, trigger: Trigger, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl<D: Database + Send + Sync + 'static> Job for SelfPeer<D> {
	async fn run(&self, _trigger: Trigger, _cancel: &CancellationToken) -> Result<()> {
		self.generate()
			.await
			.wrap_err("Self peering document not generated")?;
		Ok(())
	}
}

#[async_trait]
impl<D: Database + Send + Sync + 'static> Job for PeerCrawler<D> {
	async fn run(&self, trigger: Trigger, _cancel: &CancellationToken) -> Result<()> {
		let mode = match trigger {
			Trigger::CrawlNow => CrawlMode::Manual,
			_ => CrawlMode::Periodic,
		};
		let report = self.crawl(mode).await.wrap_err("Crawl failed")?;
		debug!(
			?mode,
			discovered = report.discovered,
			registered = report.registered,
			"Crawl job done"
		);
		Ok(())
	}
}

#[async_trait]
impl<D: Database + Send + Sync + 'static> Job for SyncEngine<D> {
	async fn run(&self, trigger: Trigger, cancel: &CancellationToken) -> Result<()> {
		let pubkey = match trigger {
			Trigger::Pull(pubkey) => pubkey,
			_ => None,
		};
		self.sync(pubkey.as_deref(), cancel)
			.await
			.wrap_err("Sync pass failed")?;
		Ok(())
	}
}

#[async_trait]
impl<D: Database + Send + Sync + 'static> Job for LivenessProber<D> {
	async fn run(&self, _trigger: Trigger, _cancel: &CancellationToken) -> Result<()> {
		let revived = self.probe().await.wrap_err("Liveness probe failed")?;
		if revived > 0 {
			info!(revived, "Peers are UP again");
		}
		Ok(())
	}
}

/// The four node jobs.
pub struct NodeJobs {
	pub self_peer: Arc<dyn Job>,
	pub crawl: Arc<dyn Job>,
	pub sync: Arc<dyn Job>,
	pub liveness: Arc<dyn Job>,
}

pub struct TaskScheduler {
	shutdown: Controller,
	queues: HashMap<JobKind, UnboundedSender<Trigger>>,
}

impl TaskScheduler {
	pub fn new() -> Self {
		TaskScheduler {
			shutdown: Controller::new(),
			queues: HashMap::new(),
		}
	}

	/// Schedules the node jobs with intervals derived from the configuration.
	pub fn start(jobs: NodeJobs, config: &SyncConfig) -> Self {
		let mut scheduler = Self::new();
		scheduler.schedule(
			JobKind::SelfPeer,
			jobs.self_peer,
			config.self_peer_interval(),
		);
		scheduler.schedule(JobKind::Crawl, jobs.crawl, config.crawl_interval());
		scheduler.schedule(JobKind::Sync, jobs.sync, config.sync_interval());
		scheduler.schedule(JobKind::Liveness, jobs.liveness, config.liveness_interval);
		scheduler
	}

	/// Runs `job` immediately, then on every `interval`.
	pub fn schedule(&mut self, kind: JobKind, job: Arc<dyn Job>, interval: Duration) {
		let (Some(ticker_monitor), Some(worker_monitor)) =
			(self.shutdown.watch(), self.shutdown.watch())
		else {
			debug!(job = %kind, "Scheduler stopped, job not scheduled");
			return;
		};
		let (sender, receiver) = mpsc::unbounded_channel();
		let interval = interval.max(MIN_INTERVAL);
		let span = info_span!("job", name = %kind);

		spawn_in_span(tick(sender.clone(), interval, ticker_monitor).instrument(span.clone()));
		spawn_in_span(work(kind, job, receiver, worker_monitor).instrument(span));
		self.queues.insert(kind, sender);
		info!(job = %kind, interval_secs = interval.as_secs(), "Job scheduled");
	}

	fn trigger(&self, kind: JobKind, trigger: Trigger) -> bool {
		let queued = self
			.queues
			.get(&kind)
			.is_some_and(|queue| queue.send(trigger).is_ok());
		if !queued {
			debug!(job = %kind, "Job not running, trigger dropped");
		}
		queued
	}

	/// Queues a crawl ignoring the enough peers threshold.
	pub fn crawl_now(&self) -> bool {
		self.trigger(JobKind::Crawl, Trigger::CrawlNow)
	}

	/// Queues a sync pass, restricted to `pubkey` if given.
	pub fn pull_blocks(&self, pubkey: Option<String>) -> bool {
		self.trigger(JobKind::Sync, Trigger::Pull(pubkey))
	}

	/// Cancellation flag raised by [`TaskScheduler::stop_all`].
	pub fn cancellation_token(&self) -> CancellationToken {
		self.shutdown.cancellation_token()
	}

	/// Stops the tickers, drops the queued triggers and waits for the running jobs to return.
	pub async fn stop_all(&mut self) {
		self.queues.clear();
		self.shutdown.shutdown().await;
		info!("All jobs stopped");
	}
}

impl Default for TaskScheduler {
	fn default() -> Self {
		Self::new()
	}
}

async fn tick(sender: UnboundedSender<Trigger>, interval: Duration, monitor: Monitor) {
	// first tick completes immediately
	let mut interval = tokio::time::interval(interval);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			biased;
			_ = monitor.canceled() => break,
			_ = interval.tick() => {
				if sender.send(Trigger::Tick).is_err() {
					break;
				}
			},
		}
	}
}

async fn work(
	kind: JobKind,
	job: Arc<dyn Job>,
	mut receiver: UnboundedReceiver<Trigger>,
	monitor: Monitor,
) {
	loop {
		let trigger = tokio::select! {
			biased;
			_ = monitor.canceled() => break,
			trigger = receiver.recv() => match trigger {
				Some(trigger) => trigger,
				None => break,
			},
		};
		debug!(job = %kind, ?trigger, "Running job");
		if let Err(error) = job.run(trigger, monitor.token()).await {
			error!(job = %kind, "{error:#}");
		}
	}
	debug!(job = %kind, "Job worker stopped");
}
