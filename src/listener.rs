//! Event hooks for background indexing.

use crate::job::{Batch, Job};

/// Receives job and batch events from the worker.
///
/// Every method has an empty default, so implementations only override what
/// they care about.
pub trait IndexListener: Send + Sync {
    fn start_job(&self, _job: &Job) {}

    fn end_job(&self, _job: &Job) {}

    fn warn(&self, _job: &Job, _message: &str) {}

    fn error(&self, _job: &Job, _message: &str) {}

    fn start_batch(&self, _batch: &Batch) {}

    fn end_batch(&self, _batch: &Batch) {}
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl IndexListener for LogListener {
    fn start_job(&self, job: &Job) {
        log::debug!("starting {job}");
    }

    fn end_job(&self, job: &Job) {
        if job.is_success() {
            log::debug!("finished {job}");
        } else {
            log::debug!("finished {job} with errors");
        }
    }

    fn warn(&self, job: &Job, message: &str) {
        log::warn!("{job}: {message}");
    }

    fn error(&self, job: &Job, message: &str) {
        log::error!("{job}: {message}");
    }

    fn start_batch(&self, batch: &Batch) {
        log::info!("starting batch {} ({} jobs)", batch.id(), batch.total());
    }

    fn end_batch(&self, batch: &Batch) {
        log::info!("finished batch {}", batch.id());
    }
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpListener;

impl IndexListener for NoOpListener {}
