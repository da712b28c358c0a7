//! Multipart upload with a bounded worker pool.
//!
//! Parts upload in any order across the workers, but completion always lists
//! them in ascending part-number order. Either every part completes and the
//! upload is finalized, or the upload is explicitly aborted so no orphan
//! remains billable.

use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
    metrics::TransferMetricsCollector,
    work_queue::WorkQueue,
};
use md5::{Digest, Md5};
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex},
    thread,
};

use super::FileInfo;

/// Objects above this size transfer as multipart uploads.
pub(crate) const MULTIPART_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// The service minimum for a non-terminal part.
pub(crate) const MIN_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024;

pub(crate) const DEFAULT_PART_SIZE_BYTES: u64 = 64 * 1024 * 1024;

pub(crate) const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Clone, Copy, Debug)]
struct PartJob {
    number: i64,
    offset: u64,
    length: u64,
}

#[derive(Clone, Debug)]
struct CompletedPart {
    number: i64,
    etag: String,
    digest: [u8; 16],
    size: u64,
}

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct CreateMultipartUploadOutput {
        pub upload_id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct UploadPartOutput {
        pub e_tag: String,
    }
}

/// Uploads `local_path` as a multipart object. A real transfer requires
/// `part_size` of at least 5 MiB; smaller values are allowed so tests can
/// exercise the pipeline with small payloads.
pub(crate) fn upload(
    invoker: &CliInvoker,
    parent_logger: &Logger,
    metrics: &TransferMetricsCollector,
    local_path: &Path,
    bucket: &str,
    key: &str,
    part_size: u64,
    concurrency: usize,
) -> Result<FileInfo, CloudError> {
    let logger = parent_logger.new(o!(
        event::BUCKET => bucket.to_owned(),
        event::STORAGE_KEY => key.to_owned(),
    ));

    let size = std::fs::metadata(local_path)
        .map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::InvalidRequest,
                "UploadFile",
                format!("cannot stat {}", local_path.display()),
            )
            .with_cause(e)
        })?
        .len();
    if size == 0 {
        return Err(CloudError::new(
            "aws",
            ErrorKind::InvalidRequest,
            "UploadFile",
            "refusing to multipart-upload an empty file",
        ));
    }

    let created: wire::CreateMultipartUploadOutput = invoker.run_json(
        "CreateMultipartUpload",
        &[
            "s3api",
            "create-multipart-upload",
            "--bucket",
            bucket,
            "--key",
            key,
            "--output",
            "json",
        ],
    )?;
    let upload_id = created.upload_id;
    info!(logger, "started multipart upload"; "size" => size, "part_size" => part_size);

    let jobs: Vec<PartJob> = part_jobs(size, part_size);
    let part_count = jobs.len();
    let queue: WorkQueue<PartJob, CompletedPart> = WorkQueue::new(jobs);
    // First worker error wins; later failures only get logged
    let first_error: Arc<Mutex<Option<CloudError>>> = Arc::new(Mutex::new(None));

    let workers: Vec<_> = (0..concurrency.min(part_count).max(1))
        .map(|_| {
            let queue = queue.clone();
            let first_error = Arc::clone(&first_error);
            let invoker = invoker.clone();
            let logger = logger.clone();
            let metrics = metrics.clone();
            let local_path = local_path.to_owned();
            let bucket = bucket.to_owned();
            let key = key.to_owned();
            let upload_id = upload_id.clone();
            thread::spawn(move || {
                while let Some(job) = queue.dequeue_job() {
                    if first_error.lock().unwrap().is_some() {
                        // Drain remaining jobs without doing the work
                        continue;
                    }
                    match upload_part(
                        &invoker, &logger, &local_path, &bucket, &key, &upload_id, job,
                    ) {
                        Ok(part) => {
                            metrics.multipart_parts.inc();
                            queue.push_result(part);
                        }
                        Err(e) => {
                            warn!(
                                logger, "part upload failed";
                                "part" => job.number,
                                "error" => e.to_string(),
                            );
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        let _ = worker.join();
    }

    if let Some(error) = first_error.lock().unwrap().take() {
        abort_upload(invoker, &logger, bucket, key, &upload_id);
        return Err(error);
    }

    let mut parts = queue.into_results().map_err(|e| {
        CloudError::new(
            "aws",
            ErrorKind::InternalError,
            "UploadFile",
            "failed to collect uploaded parts",
        )
        .with_cause(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    // Completion must list parts in ascending part-number order
    parts.sort_by_key(|part| part.number);

    let completion = serde_json::json!({
        "Parts": parts
            .iter()
            .map(|part| serde_json::json!({"ETag": part.etag, "PartNumber": part.number}))
            .collect::<Vec<_>>(),
    });
    let completion_file = write_scratch_json(&completion).map_err(|e| {
        abort_upload(invoker, &logger, bucket, key, &upload_id);
        CloudError::new(
            "aws",
            ErrorKind::InternalError,
            "CompleteMultipartUpload",
            "failed to stage completion document",
        )
        .with_cause(e)
    })?;
    let completion_arg = format!("file://{}", completion_file.path().display());

    if let Err(e) = invoker.run(
        "CompleteMultipartUpload",
        &[
            "s3api",
            "complete-multipart-upload",
            "--bucket",
            bucket,
            "--key",
            key,
            "--upload-id",
            &upload_id,
            "--multipart-upload",
            &completion_arg,
            "--output",
            "json",
        ],
    ) {
        abort_upload(invoker, &logger, bucket, key, &upload_id);
        return Err(e);
    }

    let total: u64 = parts.iter().map(|part| part.size).sum();
    debug_assert_eq!(total, size);
    info!(logger, "completed multipart upload"; "parts" => part_count);

    Ok(FileInfo {
        bucket: bucket.to_owned(),
        key: key.to_owned(),
        size: total,
        etag: Some(composite_etag(&parts)),
        storage_class: None,
        last_modified: None,
        metadata: Default::default(),
        parts_count: Some(part_count),
    })
}

fn part_jobs(size: u64, part_size: u64) -> Vec<PartJob> {
    let mut jobs = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < size {
        let length = part_size.min(size - offset);
        jobs.push(PartJob {
            number,
            offset,
            length,
        });
        offset += length;
        number += 1;
    }
    jobs
}

fn upload_part(
    invoker: &CliInvoker,
    logger: &Logger,
    local_path: &Path,
    bucket: &str,
    key: &str,
    upload_id: &str,
    job: PartJob,
) -> Result<CompletedPart, CloudError> {
    debug!(logger, "uploading part"; "part" => job.number, "bytes" => job.length);

    let mut file = File::open(local_path).map_err(|e| {
        CloudError::new(
            "aws",
            ErrorKind::InternalError,
            "UploadPart",
            format!("cannot open {}", local_path.display()),
        )
        .with_cause(e)
    })?;
    file.seek(SeekFrom::Start(job.offset)).map_err(|e| {
        CloudError::new("aws", ErrorKind::InternalError, "UploadPart", "seek failed").with_cause(e)
    })?;
    let mut buffer = vec![0u8; job.length as usize];
    file.read_exact(&mut buffer).map_err(|e| {
        CloudError::new(
            "aws",
            ErrorKind::InternalError,
            "UploadPart",
            "short read on part slice",
        )
        .with_cause(e)
    })?;

    let mut hasher = Md5::new();
    hasher.update(&buffer);
    let digest: [u8; 16] = hasher.finalize().into();

    // Each worker stages its slice as a scratch file for the CLI to stream
    let mut scratch = tempfile::NamedTempFile::new().map_err(|e| {
        CloudError::new(
            "aws",
            ErrorKind::InternalError,
            "UploadPart",
            "failed to stage part slice",
        )
        .with_cause(e)
    })?;
    scratch.write_all(&buffer).map_err(|e| {
        CloudError::new(
            "aws",
            ErrorKind::InternalError,
            "UploadPart",
            "failed to write part slice",
        )
        .with_cause(e)
    })?;

    let part_number = job.number.to_string();
    let body = scratch.path().to_string_lossy().into_owned();
    let output: wire::UploadPartOutput = invoker.run_json(
        "UploadPart",
        &[
            "s3api",
            "upload-part",
            "--bucket",
            bucket,
            "--key",
            key,
            "--upload-id",
            upload_id,
            "--part-number",
            &part_number,
            "--body",
            &body,
            "--output",
            "json",
        ],
    )?;

    Ok(CompletedPart {
        number: job.number,
        etag: output.e_tag.trim_matches('"').to_owned(),
        digest,
        size: job.length,
    })
}

fn abort_upload(invoker: &CliInvoker, logger: &Logger, bucket: &str, key: &str, upload_id: &str) {
    // Best effort: a failed abort leaves an orphan the lifecycle rule reaps
    if let Err(e) = invoker.run(
        "AbortMultipartUpload",
        &[
            "s3api",
            "abort-multipart-upload",
            "--bucket",
            bucket,
            "--key",
            key,
            "--upload-id",
            upload_id,
        ],
    ) {
        warn!(logger, "failed to abort multipart upload"; "error" => e.to_string());
    }
}

fn write_scratch_json(value: &serde_json::Value) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(value.to_string().as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// The S3 convention for multipart ETags: the MD5 of the concatenated part
/// digests, suffixed with the part count.
fn composite_etag(parts: &[CompletedPart]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.digest);
    }
    format!("{}-{}", hex::encode(hasher.finalize()), parts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli,
    };
    use assert_matches::assert_matches;

    fn invoker_for(fake: &FakeCli, metric_name: &str) -> CliInvoker {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        CliInvoker::new("aws", fake.program(), &logger, &metrics)
    }

    /// Fake `aws s3api` that records multipart calls. Part uploads append
    /// `part <n>` lines; abort appends `abort`.
    fn multipart_script(fail_part: Option<i64>) -> String {
        let fail_case = match fail_part {
            Some(number) => format!(
                r#"if [ "$part" = "{number}" ]; then echo 'An error occurred (InternalError)' 1>&2; exit 1; fi"#
            ),
            None => String::new(),
        };
        format!(
            r#"log="$(dirname "$0")/log"
case "$2" in
create-multipart-upload) echo '{{"UploadId":"upload-1"}}';;
upload-part)
    part=""
    prev=""
    for arg in "$@"; do
        if [ "$prev" = "--part-number" ]; then part="$arg"; fi
        prev="$arg"
    done
    {fail_case}
    echo "part $part" >> "$log"
    echo "{{\"ETag\":\"\\\"etag-$part\\\"\"}}";;
complete-multipart-upload) echo complete >> "$log"; echo '{{"ETag":"\"final\""}}';;
abort-multipart-upload) echo abort >> "$log";;
*) exit 1;;
esac"#
        )
    }

    fn payload(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn part_job_arithmetic() {
        // 150 bytes at 64-byte parts: 64 + 64 + 22
        let jobs = part_jobs(150, 64);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].length, 64);
        assert_eq!(jobs[1].length, 64);
        assert_eq!(jobs[2].length, 22);
        assert_eq!(jobs.iter().map(|j| j.length).sum::<u64>(), 150);
        assert_eq!(jobs[2].number, 3);
    }

    #[test]
    fn upload_completes_with_sorted_parts() {
        let fake = FakeCli::new(&multipart_script(None));
        let invoker = invoker_for(&fake, "multipart_completes");
        let metrics =
            TransferMetricsCollector::new_with_metric_name("multipart_completes").unwrap();
        let logger = setup_test_logging();
        let file = payload(150);

        let info = upload(
            &invoker,
            &logger,
            &metrics,
            file.path(),
            "apm-config",
            "configs/blob.bin",
            64,
            4,
        )
        .unwrap();

        assert_eq!(info.size, 150);
        assert_eq!(info.parts_count, Some(3));
        let etag = info.etag.unwrap();
        assert!(etag.ends_with("-3"), "etag {etag} missing part suffix");

        let log = std::fs::read_to_string(fake.scratch_path("log")).unwrap();
        assert_eq!(log.matches("part ").count(), 3);
        assert!(log.contains("complete"));
        assert!(!log.contains("abort"));
    }

    #[test]
    fn failed_part_aborts_the_upload() {
        let fake = FakeCli::new(&multipart_script(Some(2)));
        let invoker = invoker_for(&fake, "multipart_aborts");
        let metrics = TransferMetricsCollector::new_with_metric_name("multipart_aborts").unwrap();
        let logger = setup_test_logging();
        let file = payload(150);

        let err = upload(
            &invoker,
            &logger,
            &metrics,
            file.path(),
            "apm-config",
            "configs/blob.bin",
            64,
            1,
        )
        .unwrap_err();
        assert_matches!(err.kind, ErrorKind::InternalError);

        // No orphan upload: the failure must abort
        let log = std::fs::read_to_string(fake.scratch_path("log")).unwrap();
        assert!(log.contains("abort"));
        assert!(!log.contains("complete"));
    }

    #[test]
    fn empty_payload_is_rejected() {
        let fake = FakeCli::new(&multipart_script(None));
        let invoker = invoker_for(&fake, "multipart_empty");
        let metrics = TransferMetricsCollector::new_with_metric_name("multipart_empty").unwrap();
        let logger = setup_test_logging();
        let file = payload(0);

        let err = upload(
            &invoker,
            &logger,
            &metrics,
            file.path(),
            "apm-config",
            "k",
            64,
            4,
        )
        .unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn composite_etag_reflects_part_count() {
        let part = |number: i64| CompletedPart {
            number,
            etag: format!("etag-{number}"),
            digest: [number as u8; 16],
            size: 10,
        };
        let etag = composite_etag(&[part(1), part(2)]);
        assert!(etag.ends_with("-2"));
        // Stable for identical inputs
        assert_eq!(etag, composite_etag(&[part(1), part(2)]));
        // Sensitive to part content
        assert_ne!(etag, composite_etag(&[part(1), part(3)]));
    }
}
