use serde_json::Value;
use tracing::{debug, warn};

use super::{QueueError, QueueResult, WorkQueue};

/// A job claimed by this consumer.
///
/// Settling methods only act while this consumer still holds the lease; once
/// another consumer reclaimed the job after expiry they become no-ops.
#[derive(Debug)]
pub struct Job<'q> {
    queue: &'q WorkQueue,
    id: i64,
    lease: i64,
    payload: Value,
    priority: i64,
    attempts_left: u32,
}

impl<'q> Job<'q> {
    pub(super) fn new(
        queue: &'q WorkQueue,
        id: i64,
        lease: i64,
        payload: Value,
        priority: i64,
        attempts_left: u32,
    ) -> Self {
        Self { queue, id, lease, payload, priority, attempts_left }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Attempts left when the job was claimed.
    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    /// Delete the job. Calling it again (or after losing the lease) does nothing.
    pub fn complete(&self) -> QueueResult<()> {
        if self.queue.complete_job(self.id, self.lease)? {
            debug!(job_id = self.id, "completed job");
        }
        Ok(())
    }

    /// Give the job back, spending one attempt.
    ///
    /// Returns the attempts now left, or `None` if this consumer no longer
    /// holds the job. At zero the job stays locked until completed or errored.
    pub fn release(&self) -> QueueResult<Option<u32>> {
        let remaining = self.queue.release_job(self.id, self.lease)?;
        match remaining {
            Some(0) => warn!(job_id = self.id, "job released with no attempts left; kept locked"),
            Some(left) => debug!(job_id = self.id, attempts_left = left, "released job"),
            None => debug!(job_id = self.id, "release ignored; lease not held"),
        }
        Ok(remaining)
    }

    /// Mark the job errored. The record is kept for inspection.
    pub fn error(&self, message: &str) -> QueueResult<bool> {
        let updated = self.queue.error_job(self.id, self.lease, message)?;
        if updated {
            debug!(job_id = self.id, message, "job errored");
        }
        Ok(updated)
    }

    /// Run `f` on the payload, then complete on `Ok` or release on `Err`.
    ///
    /// The job is also released if `f` panics.
    pub fn scope<T, E, F>(self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Value) -> Result<T, E>,
        E: From<QueueError>,
    {
        let mut guard = ReleaseOnUnwind { job: &self, armed: true };
        let outcome = f(&self.payload);
        guard.armed = false;
        match outcome {
            Ok(value) => {
                self.complete()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(release_err) = self.release() {
                    warn!(
                        job_id = self.id,
                        error = %release_err,
                        "failed to release job after error"
                    );
                }
                Err(err)
            }
        }
    }
}

struct ReleaseOnUnwind<'a, 'q> {
    job: &'a Job<'q>,
    armed: bool,
}

impl Drop for ReleaseOnUnwind<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.job.release() {
            warn!(job_id = self.job.id, error = %err, "failed to release job after panic");
        }
    }
}
