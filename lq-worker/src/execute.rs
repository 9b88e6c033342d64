//! Job execution: turn a job into a result, or into nothing when the image
//! collaborator fails.

use std::path::Path;

use lq_proto::{Job, JobResult};

/// Run one job. An image that cannot be decoded aborts only this job: no
/// result is emitted and the server re-dispatches after the heartbeat
/// timeout eventually dismisses a genuinely dead worker.
pub fn execute_job(job: &Job) -> Option<JobResult> {
    match job {
        Job::Histogram { filename } => {
            match lq_image::file_histogram(Path::new(filename)) {
                Ok(histogram) => Some(JobResult::Histogram {
                    filename: filename.clone(),
                    histogram,
                }),
                Err(e) => {
                    eprintln!("lq-worker: histogram of {filename} failed: {e}");
                    None
                }
            }
        }
        Job::Equalisation { filename, mapping } => {
            match lq_image::equalise_file(Path::new(filename), mapping) {
                Ok(tiff_data) => Some(JobResult::Equalisation {
                    filename: filename.clone(),
                    tiff_data,
                }),
                Err(e) => {
                    eprintln!("lq-worker: equalisation of {filename} failed: {e}");
                    None
                }
            }
        }
    }
}
