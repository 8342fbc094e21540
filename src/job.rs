use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::error::{Result, ViewerError};
use crate::mask::{MaskOverlayService, MaskPrediction};

#[derive(Debug, Clone)]
pub enum MaskStatus {
    Idle,
    Busy { path: PathBuf, started: Instant },
    Ready(Arc<MaskPrediction>),
    Failed { path: PathBuf, message: String },
}

/// Runs one mask prediction at a time on a worker thread.
pub struct MaskJob {
    status: MaskStatus,
    receiver: Option<Receiver<Result<MaskPrediction>>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for MaskJob {
    fn default() -> Self {
        Self {
            status: MaskStatus::Idle,
            receiver: None,
            cancel: None,
        }
    }
}

impl MaskJob {
    /// Starts predicting `path`, cancelling any job still running. `notify`
    /// is called from the worker once a result is waiting.
    pub fn start(
        &mut self,
        service: Arc<MaskOverlayService>,
        path: PathBuf,
        notify: impl Fn() + Send + 'static,
    ) {
        self.cancel();

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Result<MaskPrediction>>();
        let worker_cancel = Arc::clone(&cancel);
        let worker_path = path.clone();
        thread::spawn(move || {
            let result = service.predict_cancellable(&worker_path, &worker_cancel);
            if tx.send(result).is_ok() {
                notify();
            }
        });

        log::info!("Started mask prediction for {}", path.display());
        self.receiver = Some(rx);
        self.cancel = Some(cancel);
        self.status = MaskStatus::Busy {
            path,
            started: Instant::now(),
        };
    }

    /// Picks up a finished result. Returns true when the status changed.
    pub fn poll(&mut self) -> bool {
        let Some(receiver) = self.receiver.take() else {
            return false;
        };
        let path = self.busy_path().unwrap_or_default();

        match receiver.try_recv() {
            Ok(Ok(prediction)) => {
                self.status = MaskStatus::Ready(Arc::new(prediction));
            }
            Ok(Err(ViewerError::Cancelled)) => {
                self.status = MaskStatus::Idle;
            }
            Ok(Err(err)) => {
                log::error!("Mask prediction failed: {err}");
                self.status = MaskStatus::Failed {
                    path,
                    message: err.to_string(),
                };
            }
            Err(TryRecvError::Empty) => {
                self.receiver = Some(receiver);
                return false;
            }
            Err(TryRecvError::Disconnected) => {
                log::error!("Mask worker for {} stopped without a result", path.display());
                self.status = MaskStatus::Failed {
                    path,
                    message: "Mask worker stopped unexpectedly".to_string(),
                };
            }
        }
        self.cancel = None;
        true
    }

    /// Abandons the running job; its result, if any, is dropped.
    pub fn cancel(&mut self) {
        if let Some(flag) = self.cancel.take() {
            flag.store(true, Ordering::Relaxed);
        }
        if self.receiver.take().is_some() {
            if let Some(path) = self.busy_path() {
                log::info!("Cancelled mask prediction for {}", path.display());
            }
            self.status = MaskStatus::Idle;
        }
    }

    /// Forgets a finished result or failure.
    pub fn dismiss(&mut self) {
        if !self.is_busy() {
            self.status = MaskStatus::Idle;
        }
    }

    pub fn status(&self) -> &MaskStatus {
        &self.status
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.status, MaskStatus::Busy { .. })
    }

    fn busy_path(&self) -> Option<PathBuf> {
        match &self.status {
            MaskStatus::Busy { path, .. } => Some(path.clone()),
            _ => None,
        }
    }
}
