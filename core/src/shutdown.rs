//! Stopping of the node jobs.
//!
//! Every scheduler task holds a [`Monitor`]. Stopping the node cancels the shared token and
//! then waits until each task has returned its monitor, so a block batch or a peer table
//! write that is in flight completes before the node exits.
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Owner of the stop signal of the node.
pub struct Controller {
	token: CancellationToken,
	// cloned into every monitor, dropped when stopping
	pending: Option<mpsc::Sender<()>>,
	// yields `None` once no sender is left
	drained: mpsc::Receiver<()>,
}

impl Controller {
	pub fn new() -> Self {
		let (pending, drained) = mpsc::channel(1);
		Controller {
			token: CancellationToken::new(),
			pending: Some(pending),
			drained,
		}
	}

	/// Monitor for one more job task, or `None` when the node is already stopping.
	pub fn watch(&self) -> Option<Monitor> {
		let pending = self.pending.clone()?;
		Some(Monitor {
			token: self.token.clone(),
			_pending: pending,
		})
	}

	/// Token cancelled when stopping begins, usable from synchronous contexts.
	pub fn cancellation_token(&self) -> CancellationToken {
		self.token.clone()
	}

	pub fn is_shutdown(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Signals every job task to stop and waits until all monitors are dropped.
	pub async fn shutdown(&mut self) {
		self.token.cancel();
		self.pending.take();
		while self.drained.recv().await.is_some() {}
	}
}

impl Default for Controller {
	fn default() -> Self {
		Self::new()
	}
}

/// Held by a job task for as long as it runs.
pub struct Monitor {
	token: CancellationToken,
	_pending: mpsc::Sender<()>,
}

impl Monitor {
	pub fn is_shutdown(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Cancellation flag polled by the long running operations.
	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	/// Completes once stopping has begun.
	pub async fn canceled(&self) {
		self.token.cancelled().await;
	}
}

/// Completes on Ctrl-C, or on SIGTERM on Unix systems.
pub async fn user_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};

		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {},
					_ = terminate.recv() => {},
				}
			},
			Err(_) => {
				let _ = tokio::signal::ctrl_c().await;
			},
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
